//! The built-in n-dimensional array type.
//!
//! An `NdArray` is a view descriptor (shape, datatype, byte order, offset,
//! strides, optional mask) over a byte buffer. The buffer may be owned,
//! lazily read from a binary block, or pending resolution from an external
//! file. Views over one base buffer serialize into a single block.

pub mod converter;
pub mod datatype;
pub mod validators;

use std::sync::Arc;

use once_cell::sync::OnceCell;

use asdf_blocks::{LazyPayload, PayloadBytes};
use asdf_core::{AsdfError, ByteOrder, Result};

pub use converter::NdArrayConverter;
pub use datatype::{Datatype, Field, ScalarKind};

/// Where an array's bytes live.
#[derive(Clone)]
pub enum NdData {
    /// Bytes owned in memory.
    Owned(Arc<Vec<u8>>),
    /// Bytes read lazily from a binary block.
    Block(Arc<LazyPayload>),
    /// Bytes in an external file, resolved by the file facade.
    External {
        /// Relative URI of the sibling file.
        uri: String,
        /// Payload installed once the external file is opened.
        resolved: Arc<OnceCell<Arc<LazyPayload>>>,
    },
}

impl NdData {
    /// Identity of the base buffer; views over one buffer share it.
    pub fn identity(&self) -> usize {
        match self {
            NdData::Owned(bytes) => Arc::as_ptr(bytes) as *const () as usize,
            NdData::Block(payload) => Arc::as_ptr(payload) as *const () as usize,
            NdData::External { resolved, .. } => Arc::as_ptr(resolved) as *const () as usize,
        }
    }

    /// The base buffer's bytes, forcing a lazy load.
    pub fn bytes(&self) -> Result<PayloadBytes> {
        match self {
            NdData::Owned(bytes) => Ok(PayloadBytes::Owned(Arc::clone(bytes))),
            NdData::Block(payload) => payload.bytes(),
            NdData::External { uri, resolved } => match resolved.get() {
                Some(payload) => payload.bytes(),
                None => Err(AsdfError::Value(format!(
                    "external array data '{}' has not been resolved",
                    uri
                ))),
            },
        }
    }
}

/// An array mask: a scalar sentinel (NaN selects NaN elements) or a
/// boolean array.
#[derive(Clone)]
pub enum Mask {
    /// Elements equal to the sentinel (or NaN, when the sentinel is NaN)
    /// are masked.
    Scalar(f64),
    /// Per-element boolean mask, possibly a view on its own block.
    Array(Arc<NdArray>),
}

/// An n-dimensional typed array view over a shared byte buffer.
pub struct NdArray {
    data: NdData,
    shape: Vec<u64>,
    dtype: Datatype,
    byteorder: ByteOrder,
    /// Byte offset of this view into the base buffer.
    offset: u64,
    /// Byte strides per dimension; `None` means C-contiguous.
    strides: Option<Vec<i64>>,
    mask: Option<Mask>,
    /// `true` when the array maps the open-ended streamed block.
    streamed: bool,
}

impl NdArray {
    /// Array over owned bytes.
    pub fn from_bytes(
        dtype: Datatype,
        shape: Vec<u64>,
        byteorder: ByteOrder,
        bytes: Vec<u8>,
    ) -> Result<Self> {
        let array = NdArray {
            data: NdData::Owned(Arc::new(bytes)),
            shape,
            dtype,
            byteorder,
            offset: 0,
            strides: None,
            mask: None,
            streamed: false,
        };
        array.check_extent()?;
        Ok(array)
    }

    /// One-dimensional float64 array in native byte order.
    pub fn from_f64(values: &[f64]) -> Self {
        let byteorder = ByteOrder::native();
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for v in values {
            match byteorder {
                ByteOrder::Big => bytes.extend_from_slice(&v.to_bits().to_be_bytes()),
                ByteOrder::Little => bytes.extend_from_slice(&v.to_bits().to_le_bytes()),
            }
        }
        NdArray::from_bytes(
            Datatype::Scalar(ScalarKind::Float64),
            vec![values.len() as u64],
            byteorder,
            bytes,
        )
        .expect("constructed extent is exact")
    }

    /// One-dimensional int32 array in native byte order.
    pub fn from_i32(values: &[i32]) -> Self {
        let byteorder = ByteOrder::native();
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            match byteorder {
                ByteOrder::Big => bytes.extend_from_slice(&v.to_be_bytes()),
                ByteOrder::Little => bytes.extend_from_slice(&v.to_le_bytes()),
            }
        }
        NdArray::from_bytes(
            Datatype::Scalar(ScalarKind::Int32),
            vec![values.len() as u64],
            byteorder,
            bytes,
        )
        .expect("constructed extent is exact")
    }

    /// One-dimensional int64 array in native byte order.
    pub fn from_i64(values: &[i64]) -> Self {
        let byteorder = ByteOrder::native();
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for v in values {
            match byteorder {
                ByteOrder::Big => bytes.extend_from_slice(&v.to_be_bytes()),
                ByteOrder::Little => bytes.extend_from_slice(&v.to_le_bytes()),
            }
        }
        NdArray::from_bytes(
            Datatype::Scalar(ScalarKind::Int64),
            vec![values.len() as u64],
            byteorder,
            bytes,
        )
        .expect("constructed extent is exact")
    }

    /// Array over a block payload read from file.
    pub(crate) fn from_block_payload(
        payload: Arc<LazyPayload>,
        dtype: Datatype,
        shape: Vec<u64>,
        byteorder: ByteOrder,
        offset: u64,
        strides: Option<Vec<i64>>,
        streamed: bool,
    ) -> Self {
        NdArray {
            data: NdData::Block(payload),
            shape,
            dtype,
            byteorder,
            offset,
            strides,
            mask: None,
            streamed,
        }
    }

    /// Array whose bytes live in an external sibling file.
    pub(crate) fn external(
        uri: String,
        dtype: Datatype,
        shape: Vec<u64>,
        byteorder: ByteOrder,
        offset: u64,
        strides: Option<Vec<i64>>,
    ) -> Self {
        NdArray {
            data: NdData::External {
                uri,
                resolved: Arc::new(OnceCell::new()),
            },
            shape,
            dtype,
            byteorder,
            offset,
            strides,
            mask: None,
            streamed: false,
        }
    }

    /// A contiguous view sharing this array's base buffer.
    ///
    /// `start` is in elements of this array's datatype; the view has the
    /// given shape.
    pub fn view(&self, start: u64, shape: Vec<u64>) -> Result<Self> {
        let view = NdArray {
            data: self.data.clone(),
            shape,
            dtype: self.dtype.clone(),
            byteorder: self.byteorder,
            offset: self.offset + start * self.dtype.itemsize(),
            strides: None,
            mask: None,
            streamed: false,
        };
        view.check_extent()?;
        Ok(view)
    }

    /// Attach a mask.
    pub fn with_mask(mut self, mask: Mask) -> Self {
        self.mask = Some(mask);
        self
    }

    /// The array shape.
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// The element datatype.
    pub fn dtype(&self) -> &Datatype {
        &self.dtype
    }

    /// Byte order of the stored elements.
    pub fn byteorder(&self) -> ByteOrder {
        self.byteorder
    }

    /// Byte offset of this view into its base buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Byte strides, when the view is not C-contiguous.
    pub fn strides(&self) -> Option<&[i64]> {
        self.strides.as_deref()
    }

    /// The attached mask, when present.
    pub fn mask(&self) -> Option<&Mask> {
        self.mask.as_ref()
    }

    /// `true` when this array maps the streamed block.
    pub fn is_streamed(&self) -> bool {
        self.streamed
    }

    /// Number of elements.
    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Bytes covered by this view when C-contiguous.
    pub fn nbytes(&self) -> u64 {
        self.element_count() * self.dtype.itemsize()
    }

    /// Identity of the base buffer, the unit of block sharing.
    pub fn data_identity(&self) -> usize {
        self.data.identity()
    }

    /// The data source descriptor.
    pub fn data(&self) -> &NdData {
        &self.data
    }

    pub(crate) fn resolve_external(&self, payload: Arc<LazyPayload>) -> Result<()> {
        match &self.data {
            NdData::External { resolved, .. } => {
                let _ = resolved.set(payload);
                Ok(())
            }
            _ => Err(AsdfError::Value("array data is not external".to_string())),
        }
    }

    pub(crate) fn external_uri(&self) -> Option<&str> {
        match &self.data {
            NdData::External { uri, .. } => Some(uri),
            _ => None,
        }
    }

    /// The bytes of the base buffer this view is defined over.
    pub fn base_bytes(&self) -> Result<PayloadBytes> {
        self.data.bytes()
    }

    /// Check `offset + extent <= buffer length` for loaded buffers.
    pub(crate) fn check_extent(&self) -> Result<()> {
        let available = match &self.data {
            NdData::Owned(bytes) => bytes.len() as u64,
            // Lazy sources are checked when forced.
            _ => return Ok(()),
        };
        let extent = self.stride_extent();
        if self.offset + extent > available {
            return Err(AsdfError::Value(format!(
                "array view (offset {}, extent {}) exceeds its buffer of {} bytes",
                self.offset, extent, available
            )));
        }
        Ok(())
    }

    /// The number of bytes between this view's first and last element,
    /// inclusive of the last element.
    pub(crate) fn stride_extent(&self) -> u64 {
        if self.element_count() == 0 {
            return 0;
        }
        match &self.strides {
            None => self.nbytes(),
            Some(strides) => {
                let mut span: i64 = 0;
                for (dim, stride) in self.shape.iter().zip(strides) {
                    if *dim > 0 {
                        span += stride.abs() * (*dim as i64 - 1);
                    }
                }
                span as u64 + self.dtype.itemsize()
            }
        }
    }

    fn element_offsets(&self) -> Vec<u64> {
        let itemsize = self.dtype.itemsize();
        let strides: Vec<i64> = match &self.strides {
            Some(strides) => strides.clone(),
            None => {
                let mut strides = vec![0i64; self.shape.len()];
                let mut acc = itemsize as i64;
                for (i, dim) in self.shape.iter().enumerate().rev() {
                    strides[i] = acc;
                    acc *= *dim as i64;
                }
                strides
            }
        };

        let count = self.element_count() as usize;
        let mut offsets = Vec::with_capacity(count);
        let mut index = vec![0u64; self.shape.len()];
        for _ in 0..count {
            let mut pos = self.offset as i64;
            for (i, &idx) in index.iter().enumerate() {
                pos += idx as i64 * strides[i];
            }
            offsets.push(pos as u64);
            // Row-major increment.
            for i in (0..index.len()).rev() {
                index[i] += 1;
                if index[i] < self.shape[i] {
                    break;
                }
                index[i] = 0;
            }
        }
        offsets
    }

    /// Decode every element as `f64`, for scalar numeric datatypes.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let kind = match &self.dtype {
            Datatype::Scalar(kind) => *kind,
            other => {
                return Err(AsdfError::Value(format!(
                    "cannot decode datatype {} as f64",
                    other.display_name()
                )))
            }
        };
        let bytes = self.base_bytes()?;
        let data = bytes.as_slice();
        let mut out = Vec::with_capacity(self.element_count() as usize);
        for pos in self.element_offsets() {
            out.push(decode_scalar_f64(data, pos as usize, kind, self.byteorder)?);
        }
        Ok(out)
    }

    /// Decode every element as `i64`, for integer datatypes.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        let values = self.to_f64_vec()?;
        Ok(values.into_iter().map(|v| v as i64).collect())
    }

    /// Evaluate the mask to one flag per element; `None` when unmasked.
    pub fn mask_flags(&self) -> Result<Option<Vec<bool>>> {
        match &self.mask {
            None => Ok(None),
            Some(Mask::Scalar(sentinel)) => {
                let values = self.to_f64_vec()?;
                let flags = if sentinel.is_nan() {
                    values.iter().map(|v| v.is_nan()).collect()
                } else {
                    values.iter().map(|v| v == sentinel).collect()
                };
                Ok(Some(flags))
            }
            Some(Mask::Array(mask)) => {
                let values = mask.to_f64_vec()?;
                Ok(Some(values.iter().map(|v| *v != 0.0).collect()))
            }
        }
    }
}

impl std::fmt::Debug for NdArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never force a lazy payload just to print.
        write!(
            f,
            "<array shape: {:?} dtype: {} offset: {}>",
            self.shape,
            self.dtype.display_name(),
            self.offset
        )
    }
}

fn decode_scalar_f64(data: &[u8], pos: usize, kind: ScalarKind, byteorder: ByteOrder) -> Result<f64> {
    let size = kind.itemsize() as usize;
    let slice = data
        .get(pos..pos + size)
        .ok_or_else(|| AsdfError::Value(format!("array data ends inside an element at byte {}", pos)))?;

    macro_rules! read_int {
        ($ty:ty) => {{
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            buf.copy_from_slice(slice);
            match byteorder {
                ByteOrder::Big => <$ty>::from_be_bytes(buf) as f64,
                ByteOrder::Little => <$ty>::from_le_bytes(buf) as f64,
            }
        }};
    }

    Ok(match kind {
        ScalarKind::Int8 => slice[0] as i8 as f64,
        ScalarKind::UInt8 | ScalarKind::Bool8 => slice[0] as f64,
        ScalarKind::Int16 => read_int!(i16),
        ScalarKind::UInt16 => read_int!(u16),
        ScalarKind::Int32 => read_int!(i32),
        ScalarKind::UInt32 => read_int!(u32),
        ScalarKind::Int64 => read_int!(i64),
        ScalarKind::UInt64 => read_int!(u64),
        ScalarKind::Float32 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(slice);
            match byteorder {
                ByteOrder::Big => f32::from_be_bytes(buf) as f64,
                ByteOrder::Little => f32::from_le_bytes(buf) as f64,
            }
        }
        ScalarKind::Float64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(slice);
            match byteorder {
                ByteOrder::Big => f64::from_be_bytes(buf),
                ByteOrder::Little => f64::from_le_bytes(buf),
            }
        }
        ScalarKind::Complex64 | ScalarKind::Complex128 => {
            return Err(AsdfError::Value(
                "complex arrays cannot be decoded as f64".to_string(),
            ))
        }
    })
}

/// A handle for writing the open-ended streamed block.
///
/// A `Stream` serializes as an ndarray whose leading dimension is `*`; the
/// actual bytes are appended after the file body with
/// `AsdfFile::write_to_stream`.
#[derive(Debug, Clone)]
pub struct Stream {
    /// Shape of one row (everything after the streamed dimension).
    pub tail_shape: Vec<u64>,
    /// Element datatype.
    pub dtype: Datatype,
    /// Byte order of the streamed bytes.
    pub byteorder: ByteOrder,
}

impl Stream {
    /// Stream of rows with the given shape and datatype.
    pub fn new(tail_shape: Vec<u64>, dtype: Datatype) -> Self {
        Stream {
            tail_shape,
            dtype,
            byteorder: ByteOrder::native(),
        }
    }

    /// Bytes per streamed row.
    pub fn row_size(&self) -> u64 {
        self.tail_shape.iter().product::<u64>() * self.dtype.itemsize()
    }
}
