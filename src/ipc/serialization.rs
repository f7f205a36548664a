//! Tensor batch codec for the shared region.
//!
//! Both messages are MessagePack. A request is a flat sequence of top-level
//! values:
//!
//! ```text
//! uint count | bin * count | str output_format | bool shapes_included
//!           | uint rank * count | uint dim * sum(ranks)
//! ```
//!
//! A response is a four-entry map, in this order: `Outputs` (name -> bin),
//! `OutputRanks` ([i32]), `OutputShapes` ([[i64]]), `OutputDataTypes` ([i32]).

use rmp::decode as de;
use rmp::encode as en;
use thiserror::Error;

use crate::defaults::{MAX_BIN_LEN, MAX_OUTPUT_FORMAT_LEN, OUTPUT_FORMAT};
use crate::tensor::{DataType, Tensor, TensorBatch};

const KEY_OUTPUTS: &str = "Outputs";
const KEY_RANKS: &str = "OutputRanks";
const KEY_SHAPES: &str = "OutputShapes";
const KEY_DATA_TYPES: &str = "OutputDataTypes";
const RESPONSE_ENTRIES: u32 = 4;

/// Errors raised while encoding or decoding a batch.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// A value is missing, malformed or of the wrong type.
    #[error("malformed field `{field}`: {reason}")]
    Field { field: String, reason: String },

    /// The request announces no shapes; there is no way to infer them.
    #[error("request carries no tensor shapes")]
    ShapesNotIncluded,

    #[error("could not encode field `{field}`: {reason}")]
    Encode { field: String, reason: String },
}

fn field_error(field: impl Into<String>, reason: impl ToString) -> CodecError {
    CodecError::Field {
        field: field.into(),
        reason: reason.to_string(),
    }
}

fn encode_error(field: impl Into<String>, reason: impl ToString) -> CodecError {
    CodecError::Encode {
        field: field.into(),
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Reading helpers over a byte cursor
// ---------------------------------------------------------------------------

fn take<'a>(rd: &mut &'a [u8], len: usize, field: &str) -> Result<&'a [u8], CodecError> {
    if len > rd.len() {
        return Err(field_error(
            field,
            format!("needs {} bytes, {} remain", len, rd.len()),
        ));
    }
    let (head, tail) = rd.split_at(len);
    *rd = tail;
    Ok(head)
}

fn read_bin<'a>(rd: &mut &'a [u8], field: &str) -> Result<&'a [u8], CodecError> {
    let len = de::read_bin_len(rd).map_err(|e| field_error(field, e))?;
    if len > MAX_BIN_LEN {
        return Err(field_error(
            field,
            format!("{} bytes exceeds the {} byte limit", len, MAX_BIN_LEN),
        ));
    }
    take(rd, len as usize, field)
}

fn read_string(rd: &mut &[u8], field: &str) -> Result<String, CodecError> {
    let len = de::read_str_len(rd).map_err(|e| field_error(field, e))?;
    let bytes = take(rd, len as usize, field)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| field_error(field, e))
}

fn expect_key(rd: &mut &[u8], key: &str) -> Result<(), CodecError> {
    let found = read_string(rd, key)?;
    if found != key {
        return Err(field_error(key, format!("found key `{}`", found)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Encode a request batch. Names and data types are not carried.
pub fn encode_request(batch: &TensorBatch) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(batch.data_len() + 32 * batch.count() + 16);

    en::write_uint(&mut buf, batch.count() as u64).map_err(|e| encode_error("count", e))?;
    for (index, tensor) in batch.iter().enumerate() {
        let len = u32::try_from(tensor.data.len())
            .ok()
            .filter(|&len| len <= MAX_BIN_LEN)
            .ok_or_else(|| {
                encode_error(
                    format!("data[{}]", index),
                    format!("{} bytes exceeds the bin limit", tensor.data.len()),
                )
            })?;
        en::write_bin_len(&mut buf, len).map_err(|e| encode_error(format!("data[{}]", index), e))?;
        buf.extend_from_slice(&tensor.data);
    }
    en::write_str(&mut buf, OUTPUT_FORMAT).map_err(|e| encode_error("output_format", e))?;
    en::write_bool(&mut buf, true).map_err(|e| encode_error("shapes_included", e))?;
    for tensor in batch.iter() {
        en::write_uint(&mut buf, tensor.rank() as u64).map_err(|e| encode_error("ranks", e))?;
    }
    for tensor in batch.iter() {
        for &dim in &tensor.shape {
            en::write_uint(&mut buf, dim).map_err(|e| encode_error("shapes", e))?;
        }
    }

    Ok(buf)
}

/// Decode a request written by [`encode_request`] or a compatible client.
///
/// Tensors come back unnamed and typed float32.
pub fn decode_request(bytes: &[u8]) -> Result<TensorBatch, CodecError> {
    let mut rd = bytes;

    let count: u32 = de::read_int(&mut rd).map_err(|e| field_error("count", e))?;
    let count = count as usize;

    // Never trust the announced count for preallocation.
    let mut blobs = Vec::with_capacity(count.min(rd.len()));
    for index in 0..count {
        blobs.push(read_bin(&mut rd, &format!("data[{}]", index))?);
    }

    let format_len = de::read_str_len(&mut rd).map_err(|e| field_error("output_format", e))?;
    if format_len > MAX_OUTPUT_FORMAT_LEN {
        return Err(field_error(
            "output_format",
            format!("{} bytes exceeds the {} byte limit", format_len, MAX_OUTPUT_FORMAT_LEN),
        ));
    }
    take(&mut rd, format_len as usize, "output_format")?;

    let shapes_included = de::read_bool(&mut rd).map_err(|e| field_error("shapes_included", e))?;
    if !shapes_included {
        return Err(CodecError::ShapesNotIncluded);
    }

    let mut ranks = Vec::with_capacity(blobs.len());
    for index in 0..count {
        let rank: u32 =
            de::read_int(&mut rd).map_err(|e| field_error(format!("ranks[{}]", index), e))?;
        ranks.push(rank as usize);
    }

    let mut tensors = Vec::with_capacity(blobs.len());
    for (index, (blob, rank)) in blobs.into_iter().zip(ranks).enumerate() {
        let mut shape = Vec::with_capacity(rank.min(rd.len()));
        for axis in 0..rank {
            let dim: u64 = de::read_int(&mut rd)
                .map_err(|e| field_error(format!("shapes[{}][{}]", index, axis), e))?;
            shape.push(dim);
        }
        tensors.push(Tensor::new(None, DataType::Float32, shape, blob.to_vec()));
    }

    Ok(TensorBatch::new(tensors))
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

fn output_name(tensor: &Tensor, index: usize) -> String {
    tensor
        .name
        .clone()
        .unwrap_or_else(|| format!("output_{}", index))
}

/// Encode a response batch.
///
/// Tensors whose type has no response width are left out of `Outputs` but
/// keep their slot in the rank, shape and type arrays.
pub fn encode_response(batch: &TensorBatch) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(batch.data_len() + 64 * batch.count() + 64);

    let recognized: Vec<(usize, &Tensor, usize)> = batch
        .iter()
        .enumerate()
        .filter_map(|(index, tensor)| match tensor.data_type.response_width() {
            Some(width) => Some((index, tensor, width)),
            None => {
                log::debug!(
                    "Skipping output {} with unsupported type {}",
                    index,
                    tensor.data_type
                );
                None
            }
        })
        .collect();

    en::write_map_len(&mut buf, RESPONSE_ENTRIES).map_err(|e| encode_error("root", e))?;

    en::write_str(&mut buf, KEY_OUTPUTS).map_err(|e| encode_error(KEY_OUTPUTS, e))?;
    en::write_map_len(&mut buf, recognized.len() as u32)
        .map_err(|e| encode_error(KEY_OUTPUTS, e))?;
    for (index, tensor, width) in recognized {
        let name = output_name(tensor, index);
        let size = tensor
            .byte_len(width)
            .ok_or_else(|| encode_error(&name, "shape overflows addressable size"))?;
        if size != tensor.data.len() {
            return Err(encode_error(
                &name,
                format!("shape implies {} bytes, buffer holds {}", size, tensor.data.len()),
            ));
        }
        let len = u32::try_from(size).map_err(|e| encode_error(&name, e))?;
        en::write_str(&mut buf, &name).map_err(|e| encode_error(&name, e))?;
        en::write_bin_len(&mut buf, len).map_err(|e| encode_error(&name, e))?;
        buf.extend_from_slice(&tensor.data);
    }

    en::write_str(&mut buf, KEY_RANKS).map_err(|e| encode_error(KEY_RANKS, e))?;
    en::write_array_len(&mut buf, batch.count() as u32).map_err(|e| encode_error(KEY_RANKS, e))?;
    for tensor in batch.iter() {
        en::write_sint(&mut buf, tensor.rank() as i64).map_err(|e| encode_error(KEY_RANKS, e))?;
    }

    en::write_str(&mut buf, KEY_SHAPES).map_err(|e| encode_error(KEY_SHAPES, e))?;
    en::write_array_len(&mut buf, batch.count() as u32)
        .map_err(|e| encode_error(KEY_SHAPES, e))?;
    for tensor in batch.iter() {
        en::write_array_len(&mut buf, tensor.rank() as u32)
            .map_err(|e| encode_error(KEY_SHAPES, e))?;
        for &dim in &tensor.shape {
            let dim = i64::try_from(dim).map_err(|e| encode_error(KEY_SHAPES, e))?;
            en::write_sint(&mut buf, dim).map_err(|e| encode_error(KEY_SHAPES, e))?;
        }
    }

    en::write_str(&mut buf, KEY_DATA_TYPES).map_err(|e| encode_error(KEY_DATA_TYPES, e))?;
    en::write_array_len(&mut buf, batch.count() as u32)
        .map_err(|e| encode_error(KEY_DATA_TYPES, e))?;
    for tensor in batch.iter() {
        en::write_sint(&mut buf, tensor.data_type.tag() as i64)
            .map_err(|e| encode_error(KEY_DATA_TYPES, e))?;
    }

    Ok(buf)
}

fn read_i32_array(rd: &mut &[u8], field: &str) -> Result<Vec<i32>, CodecError> {
    let len = de::read_array_len(rd).map_err(|e| field_error(field, e))?;
    let mut values = Vec::with_capacity((len as usize).min(rd.len()));
    for index in 0..len {
        let value: i32 =
            de::read_int(rd).map_err(|e| field_error(format!("{}[{}]", field, index), e))?;
        values.push(value);
    }
    Ok(values)
}

/// Decode a response. Only tensors present in `Outputs` are returned.
pub fn decode_response(bytes: &[u8]) -> Result<TensorBatch, CodecError> {
    let mut rd = bytes;

    let entries = de::read_map_len(&mut rd).map_err(|e| field_error("root", e))?;
    if entries != RESPONSE_ENTRIES {
        return Err(field_error(
            "root",
            format!("expected {} entries, found {}", RESPONSE_ENTRIES, entries),
        ));
    }

    expect_key(&mut rd, KEY_OUTPUTS)?;
    let output_count = de::read_map_len(&mut rd).map_err(|e| field_error(KEY_OUTPUTS, e))?;
    let mut outputs = Vec::with_capacity((output_count as usize).min(rd.len()));
    for _ in 0..output_count {
        let name = read_string(&mut rd, KEY_OUTPUTS)?;
        let blob = read_bin(&mut rd, &name)?;
        outputs.push((name, blob));
    }

    expect_key(&mut rd, KEY_RANKS)?;
    let ranks = read_i32_array(&mut rd, KEY_RANKS)?;

    expect_key(&mut rd, KEY_SHAPES)?;
    let shape_count = de::read_array_len(&mut rd).map_err(|e| field_error(KEY_SHAPES, e))?;
    let mut shapes = Vec::with_capacity((shape_count as usize).min(rd.len()));
    for index in 0..shape_count as usize {
        let field = format!("{}[{}]", KEY_SHAPES, index);
        let rank = de::read_array_len(&mut rd).map_err(|e| field_error(&field, e))?;
        let mut shape = Vec::with_capacity((rank as usize).min(rd.len()));
        for _ in 0..rank {
            let dim: i64 = de::read_int(&mut rd).map_err(|e| field_error(&field, e))?;
            let dim = u64::try_from(dim).map_err(|_| field_error(&field, "negative dimension"))?;
            shape.push(dim);
        }
        shapes.push(shape);
    }

    expect_key(&mut rd, KEY_DATA_TYPES)?;
    let tags = read_i32_array(&mut rd, KEY_DATA_TYPES)?;

    if ranks.len() != shapes.len() || ranks.len() != tags.len() {
        return Err(field_error(
            KEY_RANKS,
            format!(
                "{} ranks, {} shapes and {} data types do not line up",
                ranks.len(),
                shapes.len(),
                tags.len()
            ),
        ));
    }
    for (index, (&rank, shape)) in ranks.iter().zip(&shapes).enumerate() {
        if usize::try_from(rank).ok() != Some(shape.len()) {
            return Err(field_error(
                format!("{}[{}]", KEY_RANKS, index),
                format!("rank {} but shape has {} dimensions", rank, shape.len()),
            ));
        }
    }

    let recognized: Vec<usize> = tags
        .iter()
        .enumerate()
        .filter(|&(_, &tag)| DataType::from_tag(tag).response_width().is_some())
        .map(|(index, _)| index)
        .collect();
    if recognized.len() != outputs.len() {
        return Err(field_error(
            KEY_OUTPUTS,
            format!(
                "{} entries for {} tensors of supported type",
                outputs.len(),
                recognized.len()
            ),
        ));
    }

    let mut tensors = Vec::with_capacity(outputs.len());
    for ((name, blob), index) in outputs.into_iter().zip(recognized) {
        let tensor = Tensor::new(
            Some(name),
            DataType::from_tag(tags[index]),
            shapes[index].clone(),
            blob.to_vec(),
        );
        let field = tensor.name.as_deref().unwrap_or(KEY_OUTPUTS);
        match tensor.expected_len() {
            None => {
                return Err(field_error(
                    field,
                    format!("shape {:?} overflows addressable size", tensor.shape),
                ));
            }
            Some(len) if len != blob.len() => {
                return Err(field_error(
                    field,
                    format!("{} bytes do not match shape {:?}", blob.len(), tensor.shape),
                ));
            }
            Some(_) => {}
        }
        tensors.push(tensor);
    }

    Ok(TensorBatch::new(tensors))
}
