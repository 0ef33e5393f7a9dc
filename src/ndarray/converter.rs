//! The ndarray converter: block-backed, inline, streamed and external
//! serialization forms.

use std::sync::Arc;

use indexmap::IndexMap;

use asdf_core::{get_config, AsdfError, AsdfValue, BlockStorage, ByteOrder, NativeObject, Result};
use asdf_extension::{ConversionResult, Converter, SerializationContext, TypeRef};

use super::datatype::{Datatype, ScalarKind};
use super::{Mask, NdArray, Stream};

/// Tag pattern covering every ndarray version.
pub const NDARRAY_TAG_PATTERN: &str = "tag:stsci.edu:asdf/core/ndarray-*";

/// Converter for [`NdArray`] and [`Stream`].
pub struct NdArrayConverter;

impl Converter for NdArrayConverter {
    fn tags(&self) -> Vec<String> {
        vec![NDARRAY_TAG_PATTERN.to_string()]
    }

    fn types(&self) -> Vec<TypeRef> {
        vec![TypeRef::of::<NdArray>(), TypeRef::of::<Stream>()]
    }

    fn to_yaml_tree(
        &self,
        obj: &NativeObject,
        _tag: &str,
        ctx: &mut SerializationContext<'_>,
    ) -> Result<AsdfValue> {
        if let Some(stream) = obj.downcast_ref::<Stream>() {
            return stream_to_node(stream, obj.identity(), ctx);
        }
        let array = obj
            .downcast_ref::<NdArray>()
            .ok_or_else(|| AsdfError::Value("ndarray converter received a foreign object".to_string()))?;

        let storage = decide_storage(array, ctx)?;
        match storage {
            BlockStorage::Inline => inline_to_node(array),
            BlockStorage::Internal => block_to_node(array, ctx, false),
            BlockStorage::Streamed => block_to_node(array, ctx, true),
            BlockStorage::External => external_to_node(array, ctx),
        }
    }

    fn from_yaml_tree(
        &self,
        node: &AsdfValue,
        _tag: &str,
        ctx: &mut SerializationContext<'_>,
    ) -> Result<ConversionResult> {
        let array = match node {
            AsdfValue::Sequence(items) => inline_from_items(items, None, None)?,
            AsdfValue::Mapping(entries) => mapping_from_node(entries, ctx)?,
            _ => return Err(AsdfError::Value("invalid ndarray description".to_string())),
        };
        Ok(ConversionResult::Complete(AsdfValue::Object(NativeObject::new(array))))
    }
}

fn decide_storage(array: &NdArray, ctx: &mut SerializationContext<'_>) -> Result<BlockStorage> {
    let config = get_config();
    if let Some(storage) = config.all_array_storage {
        return Ok(storage);
    }
    // A block already bound to this buffer carries an explicit choice
    // (set_array_storage, or the storage the file was read with).
    if let Some(index) = ctx.blocks().block_for_identity(array.data_identity()) {
        let storage = ctx.blocks().block(index)?.storage();
        if storage != BlockStorage::Internal {
            return Ok(storage);
        }
    }
    if let Some(threshold) = config.array_inline_threshold {
        if array.element_count() <= threshold {
            return Ok(BlockStorage::Inline);
        }
    }
    Ok(BlockStorage::Internal)
}

fn stream_to_node(
    stream: &Stream,
    identity: usize,
    ctx: &mut SerializationContext<'_>,
) -> Result<AsdfValue> {
    let index = ctx.blocks().get_or_create_streamed_block()?;
    ctx.blocks().bind_identity(identity, index);
    let mut node = IndexMap::new();
    node.insert("source".to_string(), AsdfValue::Int(-1));
    node.insert("datatype".to_string(), datatype_to_value(&stream.dtype));
    node.insert(
        "byteorder".to_string(),
        AsdfValue::String(stream.byteorder.to_string()),
    );
    let mut shape = vec![AsdfValue::String("*".to_string())];
    shape.extend(stream.tail_shape.iter().map(|&d| AsdfValue::Int(d as i64)));
    node.insert("shape".to_string(), AsdfValue::Sequence(shape));
    Ok(AsdfValue::Mapping(node))
}

fn block_to_node(
    array: &NdArray,
    ctx: &mut SerializationContext<'_>,
    streamed: bool,
) -> Result<AsdfValue> {
    let identity = array.data_identity();
    let index = if streamed {
        ctx.blocks().get_or_create_streamed_block()?
    } else {
        match ctx.blocks().block_for_identity(identity) {
            Some(index) => index,
            None => {
                // Forcing a lazy payload is only needed for new blocks.
                let data = base_buffer(array)?;
                let index = ctx.blocks().find_or_create_block_for_data(identity, || data)?;
                ctx.blocks().bind_identity(identity, index);
                index
            }
        }
    };
    let source = ctx.blocks().source_for_block(index)?;

    let mut node = IndexMap::new();
    node.insert("source".to_string(), AsdfValue::Int(source));
    node.insert("datatype".to_string(), datatype_to_value(array.dtype()));
    node.insert(
        "byteorder".to_string(),
        AsdfValue::String(array.byteorder().to_string()),
    );
    let mut shape: Vec<AsdfValue> = array.shape().iter().map(|&d| AsdfValue::Int(d as i64)).collect();
    if streamed && !shape.is_empty() {
        shape[0] = AsdfValue::String("*".to_string());
    }
    node.insert("shape".to_string(), AsdfValue::Sequence(shape));
    if array.offset() > 0 {
        node.insert("offset".to_string(), AsdfValue::Int(array.offset() as i64));
    }
    if let Some(strides) = array.strides() {
        node.insert(
            "strides".to_string(),
            AsdfValue::Sequence(strides.iter().map(|&s| AsdfValue::Int(s)).collect()),
        );
    }
    append_mask(&mut node, array);
    Ok(AsdfValue::Mapping(node))
}

fn external_to_node(array: &NdArray, ctx: &mut SerializationContext<'_>) -> Result<AsdfValue> {
    let url = ctx
        .url()
        .ok_or_else(|| {
            AsdfError::Value(
                "can't write external blocks, since the URI of the main file is unknown".to_string(),
            )
        })?
        .to_string();

    let identity = array.data_identity();
    let index = match ctx.blocks().block_for_identity(identity) {
        Some(index) => index,
        None => {
            let data = base_buffer(array)?;
            let index = ctx.blocks().find_or_create_block_for_data(identity, || data)?;
            ctx.blocks().bind_identity(identity, index);
            index
        }
    };
    ctx.blocks().block_mut(index)?.set_storage(BlockStorage::External);
    let position = ctx
        .blocks()
        .external_block_order()
        .iter()
        .position(|&i| i == index)
        .unwrap_or(0);

    let filename = url.rsplit('/').next().unwrap_or(&url);
    let source = asdf_blocks::BlockManager::external_filename(filename, position);

    let mut node = IndexMap::new();
    node.insert("source".to_string(), AsdfValue::String(source));
    node.insert("datatype".to_string(), datatype_to_value(array.dtype()));
    node.insert(
        "byteorder".to_string(),
        AsdfValue::String(array.byteorder().to_string()),
    );
    node.insert(
        "shape".to_string(),
        AsdfValue::Sequence(array.shape().iter().map(|&d| AsdfValue::Int(d as i64)).collect()),
    );
    if array.offset() > 0 {
        node.insert("offset".to_string(), AsdfValue::Int(array.offset() as i64));
    }
    append_mask(&mut node, array);
    Ok(AsdfValue::Mapping(node))
}

/// The whole base buffer an array is a view over, shared without copying
/// when it is already in memory.
fn base_buffer(array: &NdArray) -> Result<Arc<Vec<u8>>> {
    match array.data() {
        super::NdData::Owned(bytes) => Ok(Arc::clone(bytes)),
        _ => Ok(Arc::new(array.base_bytes()?.as_slice().to_vec())),
    }
}

fn inline_to_node(array: &NdArray) -> Result<AsdfValue> {
    let mut node = IndexMap::new();
    node.insert("data".to_string(), array_to_items(array)?);
    node.insert("datatype".to_string(), datatype_to_value(array.dtype()));
    append_mask(&mut node, array);
    Ok(AsdfValue::Mapping(node))
}

fn append_mask(node: &mut IndexMap<String, AsdfValue>, array: &NdArray) {
    match array.mask() {
        Some(Mask::Scalar(sentinel)) => {
            node.insert("mask".to_string(), AsdfValue::Float(*sentinel));
        }
        Some(Mask::Array(mask)) => {
            node.insert(
                "mask".to_string(),
                AsdfValue::Object(NativeObject::from_arc(Arc::clone(mask))),
            );
        }
        None => {}
    }
}

fn mapping_from_node(
    entries: &IndexMap<String, AsdfValue>,
    ctx: &mut SerializationContext<'_>,
) -> Result<NdArray> {
    if entries.contains_key("source") && entries.contains_key("data") {
        return Err(AsdfError::Value(
            "both source and data may not be provided".to_string(),
        ));
    }

    let mask = parse_mask(entries.get("mask"))?;

    if let Some(data) = entries.get("data") {
        let items = match data {
            AsdfValue::Sequence(items) => items,
            _ => return Err(AsdfError::Value("inline ndarray data must be a sequence".to_string())),
        };
        let declared_dtype = entries
            .get("datatype")
            .map(|n| datatype_from_value(n))
            .transpose()?;
        let declared_shape = entries
            .get("shape")
            .map(|n| parse_concrete_shape(n))
            .transpose()?;
        let mut array = inline_from_items(items, declared_dtype, declared_shape)?;
        if let Some(mask) = mask {
            array = array.with_mask(mask);
        }
        return Ok(array);
    }

    let source = entries
        .get("source")
        .ok_or_else(|| AsdfError::Value("ndarray node has neither source nor data".to_string()))?;
    let dtype = entries
        .get("datatype")
        .map(|n| datatype_from_value(n))
        .transpose()?
        .ok_or_else(|| AsdfError::Value("ndarray node has no datatype".to_string()))?;
    let byteorder: ByteOrder = entries
        .get("byteorder")
        .and_then(|n| n.as_str())
        .ok_or_else(|| AsdfError::Value("ndarray node has no byteorder".to_string()))?
        .parse()?;
    let offset = entries
        .get("offset")
        .and_then(|n| match n {
            AsdfValue::Int(i) => Some(*i as u64),
            AsdfValue::UInt(u) => Some(*u),
            _ => None,
        })
        .unwrap_or(0);
    let strides = match entries.get("strides") {
        Some(AsdfValue::Sequence(items)) => Some(
            items
                .iter()
                .map(|n| match n {
                    AsdfValue::Int(i) => Ok(*i),
                    _ => Err(AsdfError::Value("strides must be integers".to_string())),
                })
                .collect::<Result<Vec<i64>>>()?,
        ),
        _ => None,
    };
    let (leading_star, mut shape) = parse_shape(entries.get("shape"))?;

    let mut array = match source {
        AsdfValue::Int(index) => {
            let block_index = ctx.blocks().block_for_source(*index)?;
            let block = ctx.blocks().block(block_index)?;
            let used = block.used_size();
            let payload = block.payload_handle();
            let streamed = *index < 0;

            if leading_star || streamed {
                // Concrete leading dimension from the block size.
                let itemsize = dtype.itemsize();
                let row_stride = match &strides {
                    Some(strides) if !strides.is_empty() => strides[0].unsigned_abs(),
                    _ => shape.iter().skip(1).product::<u64>().max(1) * itemsize,
                };
                let leading = if row_stride == 0 { 0 } else { used / row_stride };
                if shape.is_empty() {
                    shape = vec![leading];
                } else {
                    shape[0] = leading;
                }
            }

            let array = NdArray::from_block_payload(
                payload,
                dtype,
                shape,
                byteorder,
                offset,
                strides,
                streamed,
            );
            if offset + array.stride_extent() > used {
                return Err(AsdfError::Value(format!(
                    "array view (offset {}, extent {}) exceeds block of {} bytes",
                    offset,
                    array.stride_extent(),
                    used
                )));
            }
            ctx.blocks().bind_identity(array.data_identity(), block_index);
            array
        }
        AsdfValue::String(uri) => {
            if leading_star {
                return Err(AsdfError::Value(
                    "external arrays cannot be streamed".to_string(),
                ));
            }
            NdArray::external(uri.clone(), dtype, shape, byteorder, offset, strides)
        }
        _ => return Err(AsdfError::Value("invalid ndarray source".to_string())),
    };

    if let Some(mask) = mask {
        array = array.with_mask(mask);
    }
    Ok(array)
}

fn parse_mask(node: Option<&AsdfValue>) -> Result<Option<Mask>> {
    match node {
        None | Some(AsdfValue::Null) => Ok(None),
        Some(AsdfValue::Float(sentinel)) => Ok(Some(Mask::Scalar(*sentinel))),
        Some(AsdfValue::Int(sentinel)) => Ok(Some(Mask::Scalar(*sentinel as f64))),
        Some(AsdfValue::Object(obj)) => {
            let mask = obj.downcast_arc::<NdArray>().ok_or_else(|| {
                AsdfError::Value("ndarray mask must be a scalar or an array".to_string())
            })?;
            Ok(Some(Mask::Array(mask)))
        }
        Some(_) => Err(AsdfError::Value(
            "ndarray mask must be a scalar or an array".to_string(),
        )),
    }
}

/// Parse a shape node, allowing one leading `*` for streamed arrays.
fn parse_shape(node: Option<&AsdfValue>) -> Result<(bool, Vec<u64>)> {
    let items = match node {
        None => return Ok((false, Vec::new())),
        Some(AsdfValue::Sequence(items)) => items,
        Some(_) => return Err(AsdfError::Value("ndarray shape must be a sequence".to_string())),
    };
    let mut leading_star = false;
    let mut shape = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match item {
            AsdfValue::Int(d) if *d >= 0 => shape.push(*d as u64),
            AsdfValue::UInt(d) => shape.push(*d),
            AsdfValue::String(s) if s == "*" => {
                if i != 0 {
                    return Err(AsdfError::Value(
                        "'*' may only be in first entry of shape".to_string(),
                    ));
                }
                leading_star = true;
                shape.push(0);
            }
            _ => return Err(AsdfError::Value("invalid ndarray shape entry".to_string())),
        }
    }
    Ok((leading_star, shape))
}

fn parse_concrete_shape(node: &AsdfValue) -> Result<Vec<u64>> {
    let (star, shape) = parse_shape(Some(node))?;
    if star {
        return Err(AsdfError::Value(
            "inline data cannot have a streamed dimension".to_string(),
        ));
    }
    Ok(shape)
}

fn datatype_to_value(datatype: &Datatype) -> AsdfValue {
    tagged_to_value(&datatype.to_node())
}

fn datatype_from_value(value: &AsdfValue) -> Result<Datatype> {
    Datatype::from_node(&value_to_tagged(value)?)
}

// The datatype model speaks TaggedNode; bridge the small gap here rather
// than duplicating the parser.
fn tagged_to_value(node: &asdf_core::TaggedNode) -> AsdfValue {
    match &node.value {
        asdf_core::NodeValue::Null => AsdfValue::Null,
        asdf_core::NodeValue::Bool(b) => AsdfValue::Bool(*b),
        asdf_core::NodeValue::Int(i) => AsdfValue::Int(*i),
        asdf_core::NodeValue::UInt(u) => AsdfValue::UInt(*u),
        asdf_core::NodeValue::Float(f) => AsdfValue::Float(*f),
        asdf_core::NodeValue::String(s) => AsdfValue::String(s.clone()),
        asdf_core::NodeValue::Sequence(items) => {
            AsdfValue::Sequence(items.iter().map(tagged_to_value).collect())
        }
        asdf_core::NodeValue::Mapping(entries) => {
            let mut out = IndexMap::new();
            for (k, v) in entries {
                out.insert(k.clone(), tagged_to_value(v));
            }
            AsdfValue::Mapping(out)
        }
    }
}

fn value_to_tagged(value: &AsdfValue) -> Result<asdf_core::TaggedNode> {
    Ok(match value {
        AsdfValue::Null => asdf_core::TaggedNode::null(),
        AsdfValue::Bool(b) => asdf_core::TaggedNode::bool(*b),
        AsdfValue::Int(i) => asdf_core::TaggedNode::int(*i),
        AsdfValue::UInt(u) => asdf_core::TaggedNode::new(asdf_core::NodeValue::UInt(*u)),
        AsdfValue::Float(f) => asdf_core::TaggedNode::float(*f),
        AsdfValue::String(s) => asdf_core::TaggedNode::string(s.clone()),
        AsdfValue::Sequence(items) => asdf_core::TaggedNode::sequence(
            items.iter().map(value_to_tagged).collect::<Result<Vec<_>>>()?,
        ),
        AsdfValue::Mapping(entries) => {
            let mut out = IndexMap::new();
            for (k, v) in entries {
                out.insert(k.clone(), value_to_tagged(v)?);
            }
            asdf_core::TaggedNode::mapping(out)
        }
        AsdfValue::Object(obj) => {
            return Err(AsdfError::Value(format!(
                "unexpected native object '{}' inside a datatype description",
                obj.type_name()
            )))
        }
    })
}

// ---------------------------------------------------------------------
// Inline data

/// Build an array from inline nested sequences.
pub fn inline_from_items(
    items: &[AsdfValue],
    declared_dtype: Option<Datatype>,
    declared_shape: Option<Vec<u64>>,
) -> Result<NdArray> {
    let dtype = match declared_dtype {
        Some(dtype) => dtype,
        None => infer_inline_dtype(items)?,
    };
    // Record rows are themselves sequences; the row dimension is the last.
    let shape = if dtype.is_record() {
        declared_shape.clone().unwrap_or_else(|| vec![items.len() as u64])
    } else {
        infer_inline_shape(items)
    };
    if let Some(declared) = &declared_shape {
        if *declared != shape {
            return Err(AsdfError::Value(
                "inline data doesn't match the given shape".to_string(),
            ));
        }
    }

    let mut flat = Vec::new();
    flatten_inline(items, shape.len(), &mut flat)?;

    let byteorder = ByteOrder::native();
    let mut bytes = Vec::with_capacity(flat.len() * dtype.itemsize() as usize);
    match &dtype {
        Datatype::Record(fields) => {
            for row in &flat {
                let columns = row.as_sequence().ok_or_else(|| {
                    AsdfError::Value("inline record rows must be sequences".to_string())
                })?;
                if columns.len() != fields.len() {
                    return Err(AsdfError::Value(
                        "inline record row has the wrong number of columns".to_string(),
                    ));
                }
                for (column, field) in columns.iter().zip(fields) {
                    if field.shape.is_some() {
                        return Err(AsdfError::Value(
                            "inline record columns with subarray shapes are not supported"
                                .to_string(),
                        ));
                    }
                    encode_scalar(
                        column,
                        &field.datatype,
                        field.byteorder.unwrap_or(byteorder),
                        &mut bytes,
                    )?;
                }
            }
        }
        scalar => {
            for item in &flat {
                encode_scalar(item, scalar, byteorder, &mut bytes)?;
            }
        }
    }

    NdArray::from_bytes(dtype, shape, byteorder, bytes)
}

fn infer_inline_shape(items: &[AsdfValue]) -> Vec<u64> {
    let mut shape = vec![items.len() as u64];
    let mut current = items;
    while let Some(AsdfValue::Sequence(inner)) = current.first() {
        shape.push(inner.len() as u64);
        current = inner;
    }
    shape
}

fn infer_inline_dtype(items: &[AsdfValue]) -> Result<Datatype> {
    let mut saw_float = false;
    let mut saw_int = false;
    let mut saw_bool = false;
    let mut max_chars: u64 = 0;
    let mut saw_string = false;

    fn scan(
        items: &[AsdfValue],
        saw_float: &mut bool,
        saw_int: &mut bool,
        saw_bool: &mut bool,
        saw_string: &mut bool,
        max_chars: &mut u64,
    ) -> Result<()> {
        for item in items {
            match item {
                AsdfValue::Sequence(inner) => {
                    scan(inner, saw_float, saw_int, saw_bool, saw_string, max_chars)?
                }
                AsdfValue::Float(_) => *saw_float = true,
                AsdfValue::Int(_) | AsdfValue::UInt(_) => *saw_int = true,
                AsdfValue::Bool(_) => *saw_bool = true,
                AsdfValue::String(s) => {
                    *saw_string = true;
                    *max_chars = (*max_chars).max(s.chars().count() as u64);
                }
                other => {
                    return Err(AsdfError::Value(format!(
                        "inline data may only contain scalars, got {:?}",
                        std::mem::discriminant(other)
                    )))
                }
            }
        }
        Ok(())
    }
    scan(items, &mut saw_float, &mut saw_int, &mut saw_bool, &mut saw_string, &mut max_chars)?;

    if saw_string {
        if saw_float || saw_int || saw_bool {
            return Err(AsdfError::Value(
                "inline data mixes strings and numbers".to_string(),
            ));
        }
        return Ok(Datatype::Ucs4(max_chars.max(1)));
    }
    if saw_float {
        return Ok(Datatype::Scalar(ScalarKind::Float64));
    }
    if saw_int {
        return Ok(Datatype::Scalar(ScalarKind::Int64));
    }
    if saw_bool {
        return Ok(Datatype::Scalar(ScalarKind::Bool8));
    }
    // An empty array defaults to float64.
    Ok(Datatype::Scalar(ScalarKind::Float64))
}

fn flatten_inline<'a>(items: &'a [AsdfValue], depth: usize, out: &mut Vec<&'a AsdfValue>) -> Result<()> {
    if depth <= 1 {
        out.extend(items.iter());
        return Ok(());
    }
    for item in items {
        match item {
            AsdfValue::Sequence(inner) => flatten_inline(inner, depth - 1, out)?,
            _ => return Err(AsdfError::Value("ragged inline data".to_string())),
        }
    }
    Ok(())
}

fn encode_scalar(
    value: &AsdfValue,
    dtype: &Datatype,
    byteorder: ByteOrder,
    out: &mut Vec<u8>,
) -> Result<()> {
    macro_rules! push_int {
        ($v:expr, $ty:ty) => {{
            let v = $v as $ty;
            match byteorder {
                ByteOrder::Big => out.extend_from_slice(&v.to_be_bytes()),
                ByteOrder::Little => out.extend_from_slice(&v.to_le_bytes()),
            }
        }};
    }

    let numeric = |value: &AsdfValue| -> Result<f64> {
        match value {
            AsdfValue::Int(i) => Ok(*i as f64),
            AsdfValue::UInt(u) => Ok(*u as f64),
            AsdfValue::Float(f) => Ok(*f),
            AsdfValue::Bool(b) => Ok(*b as u8 as f64),
            _ => Err(AsdfError::Value("inline data element is not numeric".to_string())),
        }
    };

    match dtype {
        Datatype::Scalar(kind) => {
            let v = numeric(value)?;
            match kind {
                ScalarKind::Int8 => out.push(v as i8 as u8),
                ScalarKind::UInt8 => out.push(v as u8),
                ScalarKind::Bool8 => out.push((v != 0.0) as u8),
                ScalarKind::Int16 => push_int!(v, i16),
                ScalarKind::UInt16 => push_int!(v, u16),
                ScalarKind::Int32 => push_int!(v, i32),
                ScalarKind::UInt32 => push_int!(v, u32),
                ScalarKind::Int64 => push_int!(v as i64, i64),
                ScalarKind::UInt64 => push_int!(v as u64, u64),
                ScalarKind::Float32 => {
                    let bits = (v as f32).to_bits();
                    match byteorder {
                        ByteOrder::Big => out.extend_from_slice(&bits.to_be_bytes()),
                        ByteOrder::Little => out.extend_from_slice(&bits.to_le_bytes()),
                    }
                }
                ScalarKind::Float64 => {
                    let bits = v.to_bits();
                    match byteorder {
                        ByteOrder::Big => out.extend_from_slice(&bits.to_be_bytes()),
                        ByteOrder::Little => out.extend_from_slice(&bits.to_le_bytes()),
                    }
                }
                ScalarKind::Complex64 | ScalarKind::Complex128 => {
                    return Err(AsdfError::Value(
                        "inline complex arrays are not supported".to_string(),
                    ))
                }
            }
        }
        Datatype::Ascii(n) => {
            let s = value
                .as_str()
                .ok_or_else(|| AsdfError::Value("inline data element is not a string".to_string()))?;
            let mut field = s.as_bytes().to_vec();
            field.truncate(*n as usize);
            field.resize(*n as usize, 0);
            out.extend_from_slice(&field);
        }
        Datatype::Ucs4(n) => {
            let s = value
                .as_str()
                .ok_or_else(|| AsdfError::Value("inline data element is not a string".to_string()))?;
            let mut written = 0;
            for c in s.chars().take(*n as usize) {
                let code = c as u32;
                match byteorder {
                    ByteOrder::Big => out.extend_from_slice(&code.to_be_bytes()),
                    ByteOrder::Little => out.extend_from_slice(&code.to_le_bytes()),
                }
                written += 1;
            }
            for _ in written..*n {
                out.extend_from_slice(&[0; 4]);
            }
        }
        Datatype::Record(_) => {
            return Err(AsdfError::Value(
                "record datatypes cannot nest inside record columns".to_string(),
            ))
        }
    }
    Ok(())
}

/// Render an array's elements as inline nested sequences (strings as
/// UTF-8).
pub fn array_to_items(array: &NdArray) -> Result<AsdfValue> {
    let values = decode_all(array)?;
    Ok(nest(&values, array.shape()))
}

fn nest(values: &[AsdfValue], shape: &[u64]) -> AsdfValue {
    if shape.len() <= 1 {
        return AsdfValue::Sequence(values.to_vec());
    }
    let inner: u64 = shape[1..].iter().product();
    let chunks: Vec<AsdfValue> = values
        .chunks(inner as usize)
        .map(|chunk| nest(chunk, &shape[1..]))
        .collect();
    AsdfValue::Sequence(chunks)
}

fn decode_all(array: &NdArray) -> Result<Vec<AsdfValue>> {
    match array.dtype() {
        Datatype::Scalar(kind) => {
            let values = array.to_f64_vec()?;
            Ok(values
                .into_iter()
                .map(|v| match kind {
                    ScalarKind::Float32 | ScalarKind::Float64 => AsdfValue::Float(v),
                    ScalarKind::Bool8 => AsdfValue::Bool(v != 0.0),
                    _ => AsdfValue::Int(v as i64),
                })
                .collect())
        }
        Datatype::Ascii(_) => decode_strings(array, false),
        Datatype::Ucs4(_) => decode_strings(array, true),
        Datatype::Record(_) => Err(AsdfError::Value(
            "inline serialization of record arrays is not supported".to_string(),
        )),
    }
}

fn decode_strings(array: &NdArray, ucs4: bool) -> Result<Vec<AsdfValue>> {
    let bytes = array.base_bytes()?;
    let data = bytes.as_slice();
    let itemsize = array.dtype().itemsize() as usize;
    let mut out = Vec::with_capacity(array.element_count() as usize);
    let mut pos = array.offset() as usize;
    for _ in 0..array.element_count() {
        let field = data
            .get(pos..pos + itemsize)
            .ok_or_else(|| AsdfError::Value("array data ends inside a string element".to_string()))?;
        let s = if ucs4 {
            let mut s = String::new();
            for unit in field.chunks_exact(4) {
                let code = match array.byteorder() {
                    ByteOrder::Big => u32::from_be_bytes(unit.try_into().expect("chunk of 4")),
                    ByteOrder::Little => u32::from_le_bytes(unit.try_into().expect("chunk of 4")),
                };
                if code == 0 {
                    break;
                }
                s.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
            }
            s
        } else {
            let trimmed: Vec<u8> = field.iter().copied().take_while(|&b| b != 0).collect();
            String::from_utf8_lossy(&trimmed).into_owned()
        };
        out.push(AsdfValue::String(s));
        pos += itemsize;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_round_trip_f64() {
        let array = NdArray::from_f64(&[0.5, 1.5]);
        let items = array_to_items(&array).unwrap();
        let rebuilt = match &items {
            AsdfValue::Sequence(items) => inline_from_items(items, None, None).unwrap(),
            _ => panic!("expected a sequence"),
        };
        assert_eq!(rebuilt.to_f64_vec().unwrap(), vec![0.5, 1.5]);
        assert_eq!(rebuilt.dtype(), &Datatype::Scalar(ScalarKind::Float64));
    }

    #[test]
    fn test_inline_infers_int64() {
        let items = vec![AsdfValue::Int(1), AsdfValue::Int(2)];
        let array = inline_from_items(&items, None, None).unwrap();
        assert_eq!(array.dtype(), &Datatype::Scalar(ScalarKind::Int64));
        assert_eq!(array.to_i64_vec().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_inline_nested_shape() {
        let items = vec![
            AsdfValue::Sequence(vec![AsdfValue::Int(1), AsdfValue::Int(2)]),
            AsdfValue::Sequence(vec![AsdfValue::Int(3), AsdfValue::Int(4)]),
        ];
        let array = inline_from_items(&items, None, None).unwrap();
        assert_eq!(array.shape(), &[2, 2]);
        assert_eq!(array.to_i64_vec().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_inline_strings() {
        let items = vec![
            AsdfValue::String("ab".to_string()),
            AsdfValue::String("xyz".to_string()),
        ];
        let array = inline_from_items(&items, None, None).unwrap();
        assert_eq!(array.dtype(), &Datatype::Ucs4(3));
        let back = array_to_items(&array).unwrap();
        match back {
            AsdfValue::Sequence(items) => {
                assert_eq!(items[0].as_str(), Some("ab"));
                assert_eq!(items[1].as_str(), Some("xyz"));
            }
            _ => panic!("expected a sequence"),
        }
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let items = vec![AsdfValue::Int(1), AsdfValue::Int(2)];
        assert!(inline_from_items(&items, None, Some(vec![3])).is_err());
    }

    #[test]
    fn test_parse_shape_star() {
        let node = AsdfValue::Sequence(vec![
            AsdfValue::String("*".to_string()),
            AsdfValue::Int(4),
        ]);
        let (star, shape) = parse_shape(Some(&node)).unwrap();
        assert!(star);
        assert_eq!(shape, vec![0, 4]);

        let bad = AsdfValue::Sequence(vec![
            AsdfValue::Int(4),
            AsdfValue::String("*".to_string()),
        ]);
        assert!(parse_shape(Some(&bad)).is_err());
    }
}
