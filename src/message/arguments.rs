use anyhow::bail;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorInfo, RpcError, RpcResult};
use crate::message::value::{RpcValue, ValueKind};

/// The ordered argument container of a call. The core uses it positionally: arguments are read
///  and written by index, and the cancellation slot of a method is spliced in and out with
///  [ArgumentList::insert] / [ArgumentList::remove] so callers never need to know its position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArgumentList {
    items: Vec<RpcValue>,
}

impl ArgumentList {
    pub fn new(items: Vec<RpcValue>) -> ArgumentList {
        ArgumentList { items }
    }

    pub fn empty() -> ArgumentList {
        ArgumentList::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RpcValue> {
        self.items.get(index)
    }

    pub fn set(&mut self, index: usize, value: RpcValue) -> anyhow::Result<()> {
        match self.items.get_mut(index) {
            Some(slot) => *slot = value,
            None => bail!("argument index {} out of range (length {})", index, self.items.len()),
        }
        Ok(())
    }

    /// copies all positions that exist in both lists
    pub fn set_from(&mut self, other: &ArgumentList) {
        for (slot, value) in self.items.iter_mut().zip(other.items.iter()) {
            *slot = value.clone();
        }
    }

    pub fn insert(&mut self, index: usize, value: RpcValue) -> anyhow::Result<()> {
        if index > self.items.len() {
            bail!("argument index {} out of range (length {})", index, self.items.len());
        }
        self.items.insert(index, value);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> anyhow::Result<RpcValue> {
        if index >= self.items.len() {
            bail!("argument index {} out of range (length {})", index, self.items.len());
        }
        Ok(self.items.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RpcValue> {
        self.items.iter()
    }

    pub fn into_items(self) -> Vec<RpcValue> {
        self.items
    }

    pub fn cancellation_token(&self, index: Option<usize>) -> Option<CancellationToken> {
        index
            .and_then(|i| self.items.get(i))
            .and_then(|v| v.as_cancellation())
            .cloned()
    }

    /// the argument list without its cancellation slot, i.e. the part that travels over the wire
    pub fn without_cancellation(&self, index: Option<usize>) -> ArgumentList {
        let mut result = self.clone();
        if let Some(index) = index {
            if matches!(result.get(index), Some(RpcValue::Cancellation(_))) {
                result.items.remove(index);
            }
        }
        result
    }

    fn typed<'a, T>(&'a self, index: usize, expected: &str, f: impl FnOnce(&'a RpcValue) -> Option<T>) -> RpcResult<T> {
        self.items.get(index)
            .and_then(f)
            .ok_or_else(|| RpcError::Deserialization(format!("argument {}: expected {}", index, expected)))
    }

    pub fn value_at(&self, index: usize) -> RpcResult<RpcValue> {
        self.typed(index, "a value", |v| Some(v.clone()))
    }

    pub fn i64_at(&self, index: usize) -> RpcResult<i64> {
        self.typed(index, "i64", |v| v.as_i64())
    }

    pub fn uuid_at(&self, index: usize) -> RpcResult<Uuid> {
        self.typed(index, "uuid", |v| v.as_uuid())
    }

    pub fn bytes_at(&self, index: usize) -> RpcResult<Bytes> {
        self.typed(index, "bytes", |v| v.as_bytes().cloned())
    }

    pub fn list_at(&self, index: usize) -> RpcResult<&[RpcValue]> {
        self.typed(index, "list", |v| v.as_list())
    }

    /// `None` values are accepted as 'no error'
    pub fn error_at(&self, index: usize) -> RpcResult<Option<ErrorInfo>> {
        self.typed(index, "error", |v| match v {
            RpcValue::None => Some(None),
            RpcValue::Error(e) => Some(Some(e.clone())),
            _ => None,
        })
    }
}

/// The expected kinds of a method's (wire) arguments, by position
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArgumentShape(pub Vec<ValueKind>);

impl ArgumentShape {
    pub fn new(kinds: Vec<ValueKind>) -> ArgumentShape {
        ArgumentShape(kinds)
    }

    pub fn any(len: usize) -> ArgumentShape {
        ArgumentShape(vec![ValueKind::Any; len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `None` values are accepted in every position
    pub fn accepts(&self, index: usize, value: &RpcValue) -> bool {
        match self.0.get(index) {
            Some(ValueKind::Any) => true,
            Some(kind) => value.is_none() || value.kind() == *kind,
            None => false,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> ArgumentList {
        ArgumentList::new(vec![1i64.into(), "a".into()])
    }

    #[test]
    fn test_get_set() {
        let mut a = args();
        assert_eq!(a.get(1), Some(&RpcValue::from("a")));
        a.set(1, "b".into()).unwrap();
        assert_eq!(a.get(1), Some(&RpcValue::from("b")));
        assert!(a.set(2, RpcValue::None).is_err());
    }

    #[test]
    fn test_set_from_copies_common_positions() {
        let mut a = ArgumentList::new(vec![RpcValue::None, RpcValue::None, RpcValue::None]);
        a.set_from(&args());
        assert_eq!(a, ArgumentList::new(vec![1i64.into(), "a".into(), RpcValue::None]));
    }

    #[test]
    fn test_cancellation_slot_splicing() {
        let token = CancellationToken::new();
        let mut a = args();
        a.insert(1, RpcValue::Cancellation(token.clone())).unwrap();
        assert_eq!(a.len(), 3);
        assert!(a.cancellation_token(Some(1)).is_some());
        assert!(a.cancellation_token(Some(0)).is_none());
        assert!(a.cancellation_token(None).is_none());

        assert_eq!(a.without_cancellation(Some(1)), args());
        assert_eq!(a.without_cancellation(None), a);

        a.remove(1).unwrap();
        assert_eq!(a, args());
        assert!(a.remove(5).is_err());
        assert!(a.insert(5, RpcValue::None).is_err());
    }

    #[test]
    fn test_typed_access() {
        let a = args();
        assert_eq!(a.i64_at(0).unwrap(), 1);
        assert!(matches!(a.i64_at(1), Err(RpcError::Deserialization(_))));
        assert!(a.uuid_at(7).is_err());
        assert_eq!(ArgumentList::new(vec![RpcValue::None]).error_at(0).unwrap(), None);
    }

    #[test]
    fn test_shape_accepts() {
        let shape = ArgumentShape::new(vec![ValueKind::I64, ValueKind::Any]);
        assert!(shape.accepts(0, &5i64.into()));
        assert!(shape.accepts(0, &RpcValue::None));
        assert!(!shape.accepts(0, &"x".into()));
        assert!(shape.accepts(1, &"x".into()));
        assert!(!shape.accepts(2, &RpcValue::None));
    }
}
