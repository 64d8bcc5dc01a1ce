// layout.rs — Tensor memory layouts
//
// Element types, physical format tags, tensor shapes, and the combined
// `Layout` record carried on every graph node. Formats are opaque to the
// reorder pass except for `Format::Any` (unconstrained) and the image
// predicate; everything else is interpreted by the layout advisor.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Element types ───────────────────────────────────────────────────────────

/// Tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    F32,
    F16,
    I8,
    U8,
    I32,
    I64,
    /// Packed 1-bit elements (binary convolution inputs).
    Bin,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::I8 => "i8",
            DataType::U8 => "u8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::Bin => "bin",
        };
        write!(f, "{}", s)
    }
}

// ── Formats ─────────────────────────────────────────────────────────────────

/// Physical memory arrangement tags.
///
/// `Any` is the distinguished "unconstrained / to be decided" value used
/// throughout format assignment. The remaining tags name concrete blocked
/// or planar arrangements; their internal structure is irrelevant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Any,
    Bfyx,
    Yxfb,
    Byxf,
    BFsYxFsv4,
    BFsYxFsv16,
    BFsYxFsv32,
    BFsZyxFsv16,
    BFsZyxFsv32,
    BsFsZyxBsv16Fsv16,
    FsBYxFsv32,
    ByxfAf32,
    BinYx,
    #[serde(rename = "image_2d_weights_c4_fyx_b")]
    Image2dWeightsC4FyxB,
    #[serde(rename = "image_2d_rgba")]
    Image2dRgba,
}

impl Format {
    /// Image formats are handled by the runtime and skipped by reorder
    /// materialization.
    pub fn is_image(self) -> bool {
        matches!(self, Format::Image2dWeightsC4FyxB | Format::Image2dRgba)
    }

    /// True for every tag except `Any`.
    pub fn is_concrete(self) -> bool {
        self != Format::Any
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Format::Any => "any",
            Format::Bfyx => "bfyx",
            Format::Yxfb => "yxfb",
            Format::Byxf => "byxf",
            Format::BFsYxFsv4 => "b_fs_yx_fsv4",
            Format::BFsYxFsv16 => "b_fs_yx_fsv16",
            Format::BFsYxFsv32 => "b_fs_yx_fsv32",
            Format::BFsZyxFsv16 => "b_fs_zyx_fsv16",
            Format::BFsZyxFsv32 => "b_fs_zyx_fsv32",
            Format::BsFsZyxBsv16Fsv16 => "bs_fs_zyx_bsv16_fsv16",
            Format::FsBYxFsv32 => "fs_b_yx_fsv32",
            Format::ByxfAf32 => "byxf_af32",
            Format::BinYx => "bin_yx",
            Format::Image2dWeightsC4FyxB => "image_2d_weights_c4_fyx_b",
            Format::Image2dRgba => "image_2d_rgba",
        };
        write!(f, "{}", s)
    }
}

// ── Shapes ──────────────────────────────────────────────────────────────────

/// Logical tensor extent: batch, feature, and up to three spatial
/// dimensions (x, y, z). Unused spatial dimensions are 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    pub batch: u32,
    pub feature: u32,
    pub spatial: [u32; 3],
}

impl TensorShape {
    pub fn new(batch: u32, feature: u32, x: u32, y: u32) -> Self {
        TensorShape {
            batch,
            feature,
            spatial: [x, y, 1],
        }
    }

    pub fn with_z(batch: u32, feature: u32, x: u32, y: u32, z: u32) -> Self {
        TensorShape {
            batch,
            feature,
            spatial: [x, y, z],
        }
    }

    /// Total element count.
    pub fn count(&self) -> u64 {
        self.spatial
            .iter()
            .fold(u64::from(self.batch) * u64::from(self.feature), |acc, &d| {
                acc * u64::from(d)
            })
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[b{} f{} x{} y{} z{}]",
            self.batch, self.feature, self.spatial[0], self.spatial[1], self.spatial[2]
        )
    }
}

// ── Layout ──────────────────────────────────────────────────────────────────

/// A node's output layout: element type, memory format, and shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    pub data_type: DataType,
    pub format: Format,
    pub size: TensorShape,
}

impl Layout {
    pub fn new(data_type: DataType, format: Format, size: TensorShape) -> Self {
        Layout {
            data_type,
            format,
            size,
        }
    }

    /// Element count of the shape (used as reorder cost volume).
    pub fn count(&self) -> u64 {
        self.size.count()
    }

    /// Same layout with a different format tag.
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Same layout with a different element type.
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.data_type, self.format, self.size)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_count_is_product() {
        let s = TensorShape::new(2, 16, 1280, 720);
        assert_eq!(s.count(), 2 * 16 * 1280 * 720);
    }

    #[test]
    fn unused_spatial_dims_do_not_scale_count() {
        let s = TensorShape::new(1, 8, 10, 1);
        assert_eq!(s.count(), 80);
    }

    #[test]
    fn image_predicate() {
        assert!(Format::Image2dRgba.is_image());
        assert!(Format::Image2dWeightsC4FyxB.is_image());
        assert!(!Format::Bfyx.is_image());
        assert!(!Format::Any.is_image());
    }

    #[test]
    fn format_serde_names_match_display() {
        for fmt in [
            Format::Any,
            Format::Bfyx,
            Format::BFsYxFsv16,
            Format::BsFsZyxBsv16Fsv16,
            Format::ByxfAf32,
            Format::Image2dRgba,
        ] {
            let json = serde_json::to_string(&fmt).unwrap();
            assert_eq!(json, format!("\"{}\"", fmt));
            let back: Format = serde_json::from_str(&json).unwrap();
            assert_eq!(back, fmt);
        }
    }

    #[test]
    fn layout_with_format_keeps_rest() {
        let lay = Layout::new(DataType::I8, Format::Bfyx, TensorShape::new(1, 16, 8, 8));
        let changed = lay.with_format(Format::BFsYxFsv16);
        assert_eq!(changed.format, Format::BFsYxFsv16);
        assert_eq!(changed.data_type, DataType::I8);
        assert_eq!(changed.size, lay.size);
    }
}
