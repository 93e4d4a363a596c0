use derive_more::{Deref, From};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;
use validator::ValidateLength;

/// Cheaply clonable, immutable list used for configuration values that are
/// shared across worker tasks (exclude patterns, mail recipients).
#[derive(From, Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Deref)]
#[serde(transparent)]
pub struct ArcVec<T> {
    inner: Arc<Vec<T>>,
}

impl<T> ArcVec<T> {
    pub fn new<V: Into<Vec<T>>>(values: V) -> Self {
        Self {
            inner: Arc::new(values.into()),
        }
    }
}

impl<T> Default for ArcVec<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<T> ValidateLength<usize> for ArcVec<T> {
    fn length(&self) -> Option<usize> {
        Some(self.inner.len())
    }
}

impl<T> From<Vec<T>> for ArcVec<T> {
    fn from(value: Vec<T>) -> Self {
        Self::new(value)
    }
}

impl<T: Clone> From<&[T]> for ArcVec<T> {
    fn from(value: &[T]) -> Self {
        Self::new(value.to_vec())
    }
}

impl<T> AsRef<[T]> for ArcVec<T> {
    fn as_ref(&self) -> &[T] {
        self.inner.deref().as_ref()
    }
}

impl<T> FromIterator<T> for ArcVec<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect::<Vec<_>>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[derive(Validate)]
    struct Holder {
        #[validate(length(min = 1))]
        values: ArcVec<String>,
    }

    #[test]
    fn test_clone_shares_storage() {
        let a = ArcVec::from(vec!["*.log".to_string()]);
        let b = a.clone();
        assert!(std::ptr::eq(a.as_ref().as_ptr(), b.as_ref().as_ptr()));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_length_validation() {
        assert!(Holder { values: ArcVec::default() }.validate().is_err());
        assert!(Holder {
            values: vec!["x".to_string()].into()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_serde_transparent() {
        let v: ArcVec<String> = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(v.as_ref(), &["a".to_string(), "b".to_string()]);
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"["a","b"]"#);
    }
}
