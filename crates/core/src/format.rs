use std::{fmt, num::NonZeroU32, str::FromStr};

/// Four-character code describing a pixel layout.
///
/// # Example
/// ```rust
/// use halo_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"AR24");
/// assert_eq!(fcc.to_string(), "AR24");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding as used by kernel/driver APIs.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("fourcc must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(FourCc(arr))
    }
}

/// Resolution of a plane.
///
/// # Example
/// ```rust
/// use halo_core::prelude::Resolution;
///
/// let res = Resolution::new(1280, 800).unwrap();
/// assert_eq!(res.width.get(), 1280);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    /// Width in pixels (non-zero).
    pub width: NonZeroU32,
    /// Height in pixels (non-zero).
    pub height: NonZeroU32,
}

impl Resolution {
    /// Create a resolution, returning `None` if width or height are zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    /// Total pixel count.
    pub fn pixels(&self) -> usize {
        self.width.get() as usize * self.height.get() as usize
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Format of a hardware plane: pixel code, geometry, and bytes per pixel.
///
/// Bytes-per-pixel is carried explicitly rather than derived from the code;
/// the warp and blend units disagree on packing for some codes.
///
/// # Example
/// ```rust
/// use halo_core::prelude::{FourCc, PlaneFormat, Resolution};
///
/// let fmt = PlaneFormat::new(
///     FourCc::new(*b"AR24"),
///     Resolution::new(640, 480).unwrap(),
///     4,
/// );
/// assert_eq!(fmt.plane_bytes(), 640 * 480 * 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PlaneFormat {
    /// FourCc code describing pixel layout.
    pub code: FourCc,
    /// Plane geometry.
    pub resolution: Resolution,
    /// Bytes per pixel for the packed representation.
    pub bytes_per_pixel: usize,
}

impl PlaneFormat {
    /// Build a new format.
    pub fn new(code: FourCc, resolution: Resolution, bytes_per_pixel: usize) -> Self {
        Self {
            code,
            resolution,
            bytes_per_pixel,
        }
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> usize {
        self.resolution.width.get() as usize * self.bytes_per_pixel
    }

    /// Total plane size in bytes.
    pub fn plane_bytes(&self) -> usize {
        self.stride() * self.resolution.height.get() as usize
    }
}
