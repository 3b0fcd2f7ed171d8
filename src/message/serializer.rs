use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::ErrorInfo;
use crate::message::arguments::{ArgumentList, ArgumentShape};
use crate::message::value::{RpcValue, StreamRef, ValueKind};
use crate::object::object_id::RpcObjectId;

/// Converts argument lists to and from their wire form. `polymorphic` is set for methods whose
///  argument kinds can not be known from the method definition alone (stream items, call results)
///  - implementations must then not rely on the shape for anything but the number of arguments.
pub trait ArgumentSerializer: Send + Sync {
    fn serialize(&self, arguments: &ArgumentList, polymorphic: bool) -> anyhow::Result<Bytes>;
    fn deserialize(&self, data: &[u8], shape: &ArgumentShape, polymorphic: bool) -> anyhow::Result<ArgumentList>;
}

/// A tag-per-value, little endian encoding. Non-polymorphic arguments are validated against the
///  method's shape after decoding.
#[derive(Debug, Default)]
pub struct CompactArgumentSerializer {}

impl ArgumentSerializer for CompactArgumentSerializer {
    fn serialize(&self, arguments: &ArgumentList, _polymorphic: bool) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(arguments.len() as u32);
        for value in arguments.iter() {
            put_value(&mut buf, value)?;
        }
        Ok(buf.freeze())
    }

    fn deserialize(&self, mut data: &[u8], shape: &ArgumentShape, polymorphic: bool) -> anyhow::Result<ArgumentList> {
        let buf = &mut data;
        let len = buf.try_get_u32_le()? as usize;
        if len != shape.len() {
            bail!("expected {} arguments, got {}", shape.len(), len);
        }

        let mut items = Vec::with_capacity(len);
        for index in 0..len {
            let value = try_get_value(buf)?;
            if !polymorphic && !shape.accepts(index, &value) {
                bail!("argument {}: expected {:?}, got {:?}", index, shape.0[index], value.kind());
            }
            items.push(value);
        }

        if buf.has_remaining() {
            bail!("{} trailing bytes after arguments", buf.remaining());
        }
        Ok(ArgumentList::new(items))
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let data = try_get_bytes(buf)?;
    Ok(String::from_utf8(data.to_vec())?)
}

fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_u32_le()? as usize;
    if buf.remaining() < len {
        bail!("buffer underflow");
    }
    Ok(buf.copy_to_bytes(len))
}

fn put_value(buf: &mut BytesMut, value: &RpcValue) -> anyhow::Result<()> {
    buf.put_u8(value.kind().into());
    match value {
        RpcValue::None => {}
        RpcValue::Bool(b) => buf.put_u8(*b as u8),
        RpcValue::I64(n) => buf.put_i64_le(*n),
        RpcValue::String(s) => put_string(buf, s),
        RpcValue::Bytes(b) => {
            buf.put_u32_le(b.len() as u32);
            buf.put_slice(b);
        }
        RpcValue::Uuid(u) => buf.put_u128_le(u.as_u128()),
        RpcValue::List(items) => {
            buf.put_u32_le(items.len() as u32);
            for item in items {
                put_value(buf, item)?;
            }
        }
        RpcValue::Error(e) => {
            put_string(buf, &e.type_name);
            put_string(buf, &e.message);
        }
        RpcValue::Stream(s) => {
            buf.put_u128_le(s.id.host_id.as_u128());
            buf.put_i64_le(s.id.local_id);
            buf.put_i64_le(s.ack_period);
            buf.put_i64_le(s.ack_advance);
        }
        RpcValue::Cancellation(_) => bail!("cancellation slots can not be serialized"),
    }
    Ok(())
}

fn try_get_value(buf: &mut impl Buf) -> anyhow::Result<RpcValue> {
    let tag = buf.try_get_u8()?;
    let kind = ValueKind::try_from(tag)
        .map_err(|_| anyhow!("invalid value tag {}", tag))?;

    let value = match kind {
        ValueKind::None => RpcValue::None,
        ValueKind::Bool => RpcValue::Bool(buf.try_get_u8()? != 0),
        ValueKind::I64 => RpcValue::I64(buf.try_get_i64_le()?),
        ValueKind::String => RpcValue::String(try_get_string(buf)?),
        ValueKind::Bytes => RpcValue::Bytes(try_get_bytes(buf)?),
        ValueKind::Uuid => RpcValue::Uuid(Uuid::from_u128(buf.try_get_u128_le()?)),
        ValueKind::List => {
            let len = buf.try_get_u32_le()? as usize;
            let mut items = Vec::new();
            for _ in 0..len {
                items.push(try_get_value(buf)?);
            }
            RpcValue::List(items)
        }
        ValueKind::Error => {
            let type_name = try_get_string(buf)?;
            let message = try_get_string(buf)?;
            RpcValue::Error(ErrorInfo { type_name, message })
        }
        ValueKind::Stream => {
            let host_id = Uuid::from_u128(buf.try_get_u128_le()?);
            let local_id = buf.try_get_i64_le()?;
            RpcValue::Stream(StreamRef {
                id: RpcObjectId::new(host_id, local_id),
                ack_period: buf.try_get_i64_le()?,
                ack_advance: buf.try_get_i64_le()?,
            })
        }
        ValueKind::Cancellation | ValueKind::Any => bail!("value tag {:?} is not valid on the wire", kind),
    };
    Ok(value)
}
