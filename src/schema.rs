//! Runtime-typed point schema (the "point context").
//!
//! A schema is an ordered, append-only set of named dimensions. It defines
//! the packed record layout: `stride` bytes per point, each dimension at a
//! fixed offset given by the registration order. Once the first record is
//! committed the schema freezes and further assignment fails.
//!
//! Field bytes inside a record are machine-native; cross-host portability
//! is handled by the framed file layer, not here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{PointError, Result};

/// Name of the reserved dimension filled by the ingest façade rather than
/// the input buffer.
pub const ORIGIN_DIM: &str = "OriginId";

// ── Dimension Type ─────────────────────────────────────────────────

/// Primitive numeric type of a dimension (tag dispatch, no generics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DimType {
    /// Byte size of one value.
    pub fn size(self) -> usize {
        match self {
            DimType::U8 | DimType::I8 => 1,
            DimType::U16 | DimType::I16 => 2,
            DimType::U32 | DimType::I32 | DimType::F32 => 4,
            DimType::U64 | DimType::I64 | DimType::F64 => 8,
        }
    }

    /// Type name used in the XML schema description.
    pub fn name(self) -> &'static str {
        match self {
            DimType::U8 => "uint8_t",
            DimType::U16 => "uint16_t",
            DimType::U32 => "uint32_t",
            DimType::U64 => "uint64_t",
            DimType::I8 => "int8_t",
            DimType::I16 => "int16_t",
            DimType::I32 => "int32_t",
            DimType::I64 => "int64_t",
            DimType::F32 => "float",
            DimType::F64 => "double",
        }
    }

    /// Inverse of [`DimType::name`], for pipeline descriptions.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "uint8_t" => Some(DimType::U8),
            "uint16_t" => Some(DimType::U16),
            "uint32_t" => Some(DimType::U32),
            "uint64_t" => Some(DimType::U64),
            "int8_t" => Some(DimType::I8),
            "int16_t" => Some(DimType::I16),
            "int32_t" => Some(DimType::I32),
            "int64_t" => Some(DimType::I64),
            "float" => Some(DimType::F32),
            "double" => Some(DimType::F64),
            _ => None,
        }
    }

    /// Decode a raw field (machine-native byte order) as f64.
    pub fn read_as_f64(self, bytes: &[u8]) -> f64 {
        debug_assert!(bytes.len() >= self.size());
        match self {
            DimType::U8 => bytes[0] as f64,
            DimType::I8 => bytes[0] as i8 as f64,
            DimType::U16 => u16::from_ne_bytes(bytes[..2].try_into().unwrap()) as f64,
            DimType::I16 => i16::from_ne_bytes(bytes[..2].try_into().unwrap()) as f64,
            DimType::U32 => u32::from_ne_bytes(bytes[..4].try_into().unwrap()) as f64,
            DimType::I32 => i32::from_ne_bytes(bytes[..4].try_into().unwrap()) as f64,
            DimType::U64 => u64::from_ne_bytes(bytes[..8].try_into().unwrap()) as f64,
            DimType::I64 => i64::from_ne_bytes(bytes[..8].try_into().unwrap()) as f64,
            DimType::F32 => f32::from_ne_bytes(bytes[..4].try_into().unwrap()) as f64,
            DimType::F64 => f64::from_ne_bytes(bytes[..8].try_into().unwrap()),
        }
    }

    /// Encode an f64 into a raw field, casting to the dimension type.
    pub fn write_from_f64(self, value: f64, dst: &mut [u8]) {
        debug_assert!(dst.len() >= self.size());
        match self {
            DimType::U8 => dst[0] = value as u8,
            DimType::I8 => dst[0] = value as i8 as u8,
            DimType::U16 => dst[..2].copy_from_slice(&(value as u16).to_ne_bytes()),
            DimType::I16 => dst[..2].copy_from_slice(&(value as i16).to_ne_bytes()),
            DimType::U32 => dst[..4].copy_from_slice(&(value as u32).to_ne_bytes()),
            DimType::I32 => dst[..4].copy_from_slice(&(value as i32).to_ne_bytes()),
            DimType::U64 => dst[..8].copy_from_slice(&(value as u64).to_ne_bytes()),
            DimType::I64 => dst[..8].copy_from_slice(&(value as i64).to_ne_bytes()),
            DimType::F32 => dst[..4].copy_from_slice(&(value as f32).to_ne_bytes()),
            DimType::F64 => dst[..8].copy_from_slice(&value.to_ne_bytes()),
        }
    }
}

// ── Dimension ──────────────────────────────────────────────────────

/// One registered field of the record layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub ty: DimType,
    /// Byte offset within a packed record: sum of sizes of earlier dims.
    pub offset: usize,
}

/// Stable handle to a registered dimension (index in registration order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimId(pub usize);

// ── Schema ─────────────────────────────────────────────────────────

/// Ordered dimension registry defining the packed record layout.
#[derive(Debug)]
pub struct Schema {
    dims: Vec<Dimension>,
    by_name: HashMap<String, usize>,
    stride: usize,
    frozen: AtomicBool,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self {
            dims: Vec::new(),
            by_name: HashMap::new(),
            stride: 0,
            frozen: AtomicBool::new(false),
        }
    }

    /// Default session point layout. The ingest façade assigns the
    /// reserved `OriginId` dimension on top of this.
    pub fn standard() -> Self {
        let mut schema = Schema::new();
        for (name, ty) in [
            ("X", DimType::F64),
            ("Y", DimType::F64),
            ("Z", DimType::F64),
            ("ScanAngleRank", DimType::F32),
            ("Intensity", DimType::U16),
            ("PointSourceId", DimType::U16),
            ("ReturnNumber", DimType::U8),
            ("NumberOfReturns", DimType::U8),
            ("ScanDirectionFlag", DimType::U8),
            ("Classification", DimType::U8),
        ] {
            schema.assign(name, ty).expect("fresh schema");
        }
        schema
    }

    /// Append a dimension and return its handle.
    ///
    /// Fails with `SchemaFrozen` after the first committed record and with
    /// `DuplicateDim` on a name collision.
    pub fn assign(&mut self, name: &str, ty: DimType) -> Result<DimId> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(PointError::SchemaFrozen(name.to_string()));
        }
        if self.by_name.contains_key(name) {
            return Err(PointError::DuplicateDim(name.to_string()));
        }
        let id = self.dims.len();
        self.dims.push(Dimension {
            name: name.to_string(),
            ty,
            offset: self.stride,
        });
        self.by_name.insert(name.to_string(), id);
        self.stride += ty.size();
        Ok(DimId(id))
    }

    /// Freeze the layout. Called when the first record is committed;
    /// idempotent.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Dimensions in registration order.
    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Byte length of one packed record.
    pub fn point_size(&self) -> usize {
        self.stride
    }

    pub fn offset_of(&self, id: DimId) -> usize {
        self.dims[id.0].offset
    }

    pub fn size_of(&self, id: DimId) -> usize {
        self.dims[id.0].ty.size()
    }

    /// Look up a dimension handle by name.
    pub fn find(&self, name: &str) -> Option<DimId> {
        self.by_name.get(name).copied().map(DimId)
    }

    /// Decode one field of a packed record as f64.
    pub fn field_f64(&self, record: &[u8], id: DimId) -> f64 {
        let dim = &self.dims[id.0];
        dim.ty.read_as_f64(&record[dim.offset..dim.offset + dim.ty.size()])
    }

    /// Pack one source row into `dst[0..stride]`.
    ///
    /// Dimensions present in both schemas (same name and type) copy their
    /// raw bytes. The reserved `OriginId` dimension, when absent from the
    /// source, is filled from `origin`. Any other missing dimension is
    /// zero-filled.
    pub fn pack(&self, src_schema: &Schema, row: &[u8], origin: u64, dst: &mut [u8]) {
        debug_assert_eq!(row.len(), src_schema.point_size());
        debug_assert!(dst.len() >= self.stride);

        for dim in &self.dims {
            let out = &mut dst[dim.offset..dim.offset + dim.ty.size()];
            match src_schema.find(&dim.name) {
                Some(src_id) if src_schema.dims[src_id.0].ty == dim.ty => {
                    let src_off = src_schema.offset_of(src_id);
                    out.copy_from_slice(&row[src_off..src_off + dim.ty.size()]);
                }
                _ if dim.name == ORIGIN_DIM => {
                    out.copy_from_slice(&origin.to_ne_bytes());
                }
                _ => out.fill(0),
            }
        }
    }

    /// XML description of the packed layout, one `<dimension>` element per
    /// field in registration order.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<PointCloudSchema>\n");
        for (position, dim) in self.dims.iter().enumerate() {
            out.push_str(&format!(
                "  <dimension><name>{}</name><type>{}</type><size>{}</size><position>{}</position></dimension>\n",
                dim.name,
                dim.ty.name(),
                dim.ty.size(),
                position + 1,
            ));
        }
        out.push_str("</PointCloudSchema>\n");
        out
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn xyz_schema() -> Schema {
        let mut s = Schema::new();
        s.assign("X", DimType::F64).unwrap();
        s.assign("Y", DimType::F64).unwrap();
        s.assign("Z", DimType::F64).unwrap();
        s
    }

    #[test]
    fn test_offsets_and_stride() {
        let mut s = Schema::new();
        let x = s.assign("X", DimType::F64).unwrap();
        let i = s.assign("Intensity", DimType::U16).unwrap();
        let c = s.assign("Classification", DimType::U8).unwrap();

        assert_eq!(s.offset_of(x), 0);
        assert_eq!(s.offset_of(i), 8);
        assert_eq!(s.offset_of(c), 10);
        assert_eq!(s.point_size(), 11);
        assert_eq!(s.size_of(i), 2);
    }

    #[test]
    fn test_duplicate_dim_rejected() {
        let mut s = xyz_schema();
        let err = s.assign("X", DimType::F64).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_DIM");
    }

    #[test]
    fn test_frozen_schema_rejects_assign() {
        let mut s = xyz_schema();
        s.freeze();
        let err = s.assign("W", DimType::F64).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_FROZEN");
        // Reads still work after freeze.
        assert_eq!(s.point_size(), 24);
    }

    #[test]
    fn test_pack_copies_shared_dims() {
        let src = xyz_schema();
        let mut dst_schema = xyz_schema();
        dst_schema.assign(ORIGIN_DIM, DimType::U64).unwrap();

        let mut row = vec![0u8; src.point_size()];
        row[0..8].copy_from_slice(&1.5f64.to_ne_bytes());
        row[8..16].copy_from_slice(&2.5f64.to_ne_bytes());
        row[16..24].copy_from_slice(&3.5f64.to_ne_bytes());

        let mut packed = vec![0u8; dst_schema.point_size()];
        dst_schema.pack(&src, &row, 42, &mut packed);

        let x = dst_schema.find("X").unwrap();
        let y = dst_schema.find("Y").unwrap();
        let z = dst_schema.find("Z").unwrap();
        assert_eq!(dst_schema.field_f64(&packed, x), 1.5);
        assert_eq!(dst_schema.field_f64(&packed, y), 2.5);
        assert_eq!(dst_schema.field_f64(&packed, z), 3.5);

        let origin = dst_schema.find(ORIGIN_DIM).unwrap();
        let off = dst_schema.offset_of(origin);
        assert_eq!(u64::from_ne_bytes(packed[off..off + 8].try_into().unwrap()), 42);
    }

    #[test]
    fn test_pack_zero_fills_missing_dims() {
        let src = xyz_schema();
        let mut dst_schema = xyz_schema();
        dst_schema.assign("Intensity", DimType::U16).unwrap();

        let row = vec![0xffu8; src.point_size()];
        let mut packed = vec![0xaau8; dst_schema.point_size()];
        dst_schema.pack(&src, &row, 0, &mut packed);

        let intensity = dst_schema.find("Intensity").unwrap();
        let off = dst_schema.offset_of(intensity);
        assert_eq!(&packed[off..off + 2], &[0, 0]);
    }

    #[test]
    fn test_pack_ignores_type_mismatch() {
        let mut src = Schema::new();
        src.assign("X", DimType::F32).unwrap();

        let mut dst_schema = Schema::new();
        dst_schema.assign("X", DimType::F64).unwrap();

        let row = vec![0xffu8; src.point_size()];
        let mut packed = vec![0xaau8; dst_schema.point_size()];
        dst_schema.pack(&src, &row, 0, &mut packed);

        // Mismatched type treated as missing, so zero-filled.
        assert_eq!(&packed[..8], &[0u8; 8]);
    }

    #[test]
    fn test_standard_layout() {
        let s = Schema::standard();
        assert_eq!(s.dims().len(), 10);
        assert_eq!(s.point_size(), 36);
        assert_eq!(s.offset_of(s.find("Z").unwrap()), 16);
        assert!(s.find(ORIGIN_DIM).is_none());
    }

    #[test]
    fn test_xml_lists_every_dim_in_order() {
        let mut s = xyz_schema();
        s.assign(ORIGIN_DIM, DimType::U64).unwrap();
        let xml = s.to_xml();
        assert!(xml.starts_with("<?xml"));
        let x_pos = xml.find("<name>X</name>").unwrap();
        let origin_pos = xml.find("<name>OriginId</name>").unwrap();
        assert!(x_pos < origin_pos);
        assert!(xml.contains("<type>uint64_t</type>"));
        assert!(xml.contains("<position>4</position>"));
    }

    proptest! {
        /// Every dimension fits within the stride, and the sizes sum to it.
        #[test]
        fn prop_layout_invariants(types in prop::collection::vec(0u8..10, 1..16)) {
            let all = [
                DimType::U8, DimType::U16, DimType::U32, DimType::U64,
                DimType::I8, DimType::I16, DimType::I32, DimType::I64,
                DimType::F32, DimType::F64,
            ];
            let mut schema = Schema::new();
            for (i, t) in types.iter().enumerate() {
                schema.assign(&format!("d{}", i), all[*t as usize]).unwrap();
            }

            let stride = schema.point_size();
            let mut sum = 0;
            for (i, dim) in schema.dims().iter().enumerate() {
                let id = DimId(i);
                prop_assert!(schema.offset_of(id) + schema.size_of(id) <= stride);
                sum += schema.size_of(id);
            }
            prop_assert_eq!(sum, stride);
        }
    }
}
