//! Typed attributes attached to nodes, tensor descriptors and graphs.
//!
//! Attributes are a flexible-schema map from names to [`AttrValue`]s. Each
//! accessor is typed at the call site and returns `None` (or an
//! [`AttrError`]) if the attribute is missing or has a different type.

use std::error::Error;
use std::fmt;

use rustc_hash::FxHashMap;

use super::node::{DataType, TensorDesc};

/// Index of the enclosing dispatch node's anchor that a boundary node
/// corresponds to. Set on subgraph `Data` nodes and on the input tensor
/// descriptors of subgraph `NetOutput` nodes.
pub const ATTR_NAME_PARENT_NODE_INDEX: &str = "_parent_node_index";

/// Integer scope index. Nodes sharing a non-negative index are extracted
/// into one subgraph.
pub const ATTR_NAME_SUBGRAPH_MULTI_DIMS_INDEX: &str = "_subgraph_multi_dims_index";

/// Per-gear `"index:dims"` strings for a dynamic input (tensor attribute).
pub const ATTR_NAME_SUBGRAPH_MULTI_DIMS_INPUT_SHAPE: &str = "_subgraph_multi_dims_input_shape";

/// Flattened per-gear dims table for a dynamic input, `rank` values per gear
/// (tensor attribute).
pub const ATTR_NAME_SUBGRAPH_MULTI_DIMS_INPUT_DIMS: &str = "_subgraph_multi_dims_input_dims";

/// Marker set on a dispatch node produced by scope extraction.
pub const ATTR_NAME_SUBGRAPH_MULTI_DIMS_PROCESSED: &str = "_subgraph_multi_dims_processed";

/// Marker set on a dispatch node whose subgraph was expanded into gears.
pub const ATTR_NAME_SUBGRAPH_MULTI_DIMS_CLONED: &str = "_subgraph_multi_dims_cloned";

/// Per-output max shape of a node, eg. `"4,3;5,4"`.
pub const ATTR_NAME_OP_MAX_SHAPE: &str = "_op_max_shape";

/// Unknown-dim values of one gear, attached to each gear subgraph.
pub const ATTR_NAME_SUBGRAPH_REAL_DIMS: &str = "_subgraph_real_dims";

/// Input dims of a gear `Data` node before the gear shape was applied.
pub const ATTR_NAME_MBATCH_ORIGIN_INPUT_DIMS: &str = "_mbatch_origin_input_dims";

/// Number of gears of a `Case` node.
pub const ATTR_NAME_BATCH_NUM: &str = "batch_num";

/// Prefix of the per-gear dims tuple attributes of a `Case` node.
pub const ATTR_NAME_PRED_VALUE: &str = "pred_value";

/// Weight of a `Const` node.
pub const ATTR_NAME_WEIGHTS: &str = "value";

/// Input count of a `Concat` node.
pub const ATTR_NAME_N: &str = "N";

/// Name of the `pred_value` attribute for gear `index`.
pub fn pred_value_attr_name(index: usize) -> String {
    format!("{}_{}", ATTR_NAME_PRED_VALUE, index)
}

/// Data for a constant tensor stored in an attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float(Vec<f32>),
}

/// A constant tensor, such as the weight of a `Const` node.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorValue {
    shape: Vec<usize>,
    data: TensorData,
}

impl TensorValue {
    /// Create a tensor from a shape and data.
    ///
    /// Panics if the data length does not match the shape.
    pub fn new(shape: &[usize], data: TensorData) -> TensorValue {
        let len = match &data {
            TensorData::Int32(v) => v.len(),
            TensorData::Int64(v) => v.len(),
            TensorData::Float(v) => v.len(),
        };
        assert_eq!(
            len,
            shape.iter().product::<usize>(),
            "tensor data length does not match shape {:?}",
            shape
        );
        TensorValue {
            shape: shape.to_vec(),
            data,
        }
    }

    /// Create a scalar int32 tensor.
    pub fn scalar_i32(value: i32) -> TensorValue {
        Self::new(&[], TensorData::Int32(vec![value]))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn dtype(&self) -> DataType {
        match self.data {
            TensorData::Int32(_) => DataType::Int32,
            TensorData::Int64(_) => DataType::Int64,
            TensorData::Float(_) => DataType::Float,
        }
    }
}

/// Value of an attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Bool(bool),
    Str(String),
    ListInt(Vec<i64>),
    ListStr(Vec<String>),
    Tensor(TensorValue),
}

impl AttrValue {
    fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Int(_) => "int",
            AttrValue::Bool(_) => "bool",
            AttrValue::Str(_) => "str",
            AttrValue::ListInt(_) => "list_int",
            AttrValue::ListStr(_) => "list_str",
            AttrValue::Tensor(_) => "tensor",
        }
    }
}

impl From<i64> for AttrValue {
    fn from(val: i64) -> AttrValue {
        AttrValue::Int(val)
    }
}

impl From<bool> for AttrValue {
    fn from(val: bool) -> AttrValue {
        AttrValue::Bool(val)
    }
}

impl From<&str> for AttrValue {
    fn from(val: &str) -> AttrValue {
        AttrValue::Str(val.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(val: String) -> AttrValue {
        AttrValue::Str(val)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(val: Vec<i64>) -> AttrValue {
        AttrValue::ListInt(val)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(val: Vec<String>) -> AttrValue {
        AttrValue::ListStr(val)
    }
}

impl From<TensorValue> for AttrValue {
    fn from(val: TensorValue) -> AttrValue {
        AttrValue::Tensor(val)
    }
}

/// Errors from the `Result`-returning attribute accessors.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrError {
    /// The attribute is not present.
    NotFound(String),

    /// The attribute is present but has a different type.
    WrongType {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl fmt::Display for AttrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrError::NotFound(name) => write!(f, "attribute \"{}\" not found", name),
            AttrError::WrongType {
                name,
                expected,
                actual,
            } => write!(
                f,
                "attribute \"{}\" has type {} but {} was expected",
                name, actual, expected
            ),
        }
    }
}

impl Error for AttrError {}

/// Map of named attributes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttrMap {
    attrs: FxHashMap<String, AttrValue>,
}

macro_rules! typed_getters {
    ($get:ident, $try_get:ident, $variant:ident, $ret:ty, $expected:literal, |$v:ident| $conv:expr) => {
        pub fn $get(&self, name: &str) -> Option<$ret> {
            match self.attrs.get(name) {
                Some(AttrValue::$variant($v)) => Some($conv),
                _ => None,
            }
        }

        pub fn $try_get(&self, name: &str) -> Result<$ret, AttrError> {
            match self.attrs.get(name) {
                Some(AttrValue::$variant($v)) => Ok($conv),
                Some(other) => Err(AttrError::WrongType {
                    name: name.to_string(),
                    expected: $expected,
                    actual: other.type_name(),
                }),
                None => Err(AttrError::NotFound(name.to_string())),
            }
        }
    };
}

impl AttrMap {
    pub fn new() -> AttrMap {
        AttrMap::default()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Set an attribute, returning the previous value if any.
    pub fn set(&mut self, name: &str, value: impl Into<AttrValue>) -> Option<AttrValue> {
        self.attrs.insert(name.to_string(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<AttrValue> {
        self.attrs.remove(name)
    }

    /// Iterate over attribute names and values, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy every attribute of `other` into `self`, overwriting attributes
    /// with the same name.
    pub fn extend_from(&mut self, other: &AttrMap) {
        for (name, value) in other.attrs.iter() {
            self.attrs.insert(name.clone(), value.clone());
        }
    }

    typed_getters!(get_int, try_get_int, Int, i64, "int", |v| *v);
    typed_getters!(get_bool, try_get_bool, Bool, bool, "bool", |v| *v);
    typed_getters!(get_str, try_get_str, Str, &str, "str", |v| v.as_str());
    typed_getters!(get_list_int, try_get_list_int, ListInt, &[i64], "list_int", |v| v.as_slice());
    typed_getters!(get_list_str, try_get_list_str, ListStr, &[String], "list_str", |v| v.as_slice());
    typed_getters!(get_tensor, try_get_tensor, Tensor, &TensorValue, "tensor", |v| v);
}

/// Copy all attributes of `src` into `dst`.
///
/// This is a deep copy of every attribute, so provenance recorded on the
/// original tensor survives duplication of the node.
pub fn copy_tensor_attrs(src: &TensorDesc, dst: &mut TensorDesc) {
    dst.attrs.extend_from(&src.attrs);
}

/// Read a parent index attribute.
///
/// Negative values are treated as absent.
pub fn parent_index(attrs: &AttrMap) -> Option<usize> {
    attrs
        .get_int(ATTR_NAME_PARENT_NODE_INDEX)
        .and_then(|idx| usize::try_from(idx).ok())
}

pub fn set_parent_index(attrs: &mut AttrMap, index: usize) {
    attrs.set(ATTR_NAME_PARENT_NODE_INDEX, index as i64);
}

#[cfg(test)]
mod tests {
    use super::{
        copy_tensor_attrs, parent_index, set_parent_index, AttrError, AttrMap, AttrValue,
        TensorData, TensorValue, ATTR_NAME_PARENT_NODE_INDEX,
    };
    use crate::graph::{DataType, TensorDesc};

    #[test]
    fn test_typed_getters() {
        let mut attrs = AttrMap::new();
        attrs.set("int", 3i64);
        attrs.set("str", "abc");
        attrs.set("dims", vec![1i64, -1]);

        assert_eq!(attrs.get_int("int"), Some(3));
        assert_eq!(attrs.get_str("str"), Some("abc"));
        assert_eq!(attrs.get_list_int("dims"), Some([1, -1].as_slice()));

        // Wrong type and missing attributes are both `None`.
        assert_eq!(attrs.get_int("str"), None);
        assert_eq!(attrs.get_bool("missing"), None);
    }

    #[test]
    fn test_try_getters() {
        let mut attrs = AttrMap::new();
        attrs.set("flag", true);

        assert_eq!(attrs.try_get_bool("flag"), Ok(true));
        assert_eq!(
            attrs.try_get_int("flag"),
            Err(AttrError::WrongType {
                name: "flag".into(),
                expected: "int",
                actual: "bool",
            })
        );
        assert_eq!(
            attrs.try_get_str("missing"),
            Err(AttrError::NotFound("missing".into()))
        );
    }

    #[test]
    fn test_set_returns_previous() {
        let mut attrs = AttrMap::new();
        assert_eq!(attrs.set("x", 1i64), None);
        assert_eq!(attrs.set("x", 2i64), Some(AttrValue::Int(1)));
        assert_eq!(attrs.remove("x"), Some(AttrValue::Int(2)));
        assert!(attrs.is_empty());
    }

    #[test]
    fn test_copy_tensor_attrs_is_deep() {
        let mut src = TensorDesc::new(DataType::Float, &[-1, 3]);
        src.attrs.set("origin", vec!["a".to_string()]);
        let mut dst = TensorDesc::new(DataType::Float, &[2, 3]);
        dst.attrs.set("keep", 1i64);

        copy_tensor_attrs(&src, &mut dst);
        src.attrs.set("origin", vec!["b".to_string()]);

        assert_eq!(dst.attrs.get_list_str("origin"), Some(["a".to_string()].as_slice()));
        assert_eq!(dst.attrs.get_int("keep"), Some(1));
        // Only attributes are copied, not the shape.
        assert_eq!(dst.shape, [2, 3]);
    }

    #[test]
    fn test_parent_index() {
        let mut attrs = AttrMap::new();
        assert_eq!(parent_index(&attrs), None);
        set_parent_index(&mut attrs, 2);
        assert_eq!(parent_index(&attrs), Some(2));
        attrs.set(ATTR_NAME_PARENT_NODE_INDEX, -1i64);
        assert_eq!(parent_index(&attrs), None);
    }

    #[test]
    fn test_tensor_value() {
        let t = TensorValue::new(&[2, 2], TensorData::Int32(vec![1, 1, 2, 2]));
        assert_eq!(t.shape(), &[2, 2]);
        assert_eq!(t.dtype(), DataType::Int32);
        assert_eq!(TensorValue::scalar_i32(0).shape(), &[] as &[usize]);
    }

    #[test]
    #[should_panic(expected = "does not match shape")]
    fn test_tensor_value_bad_len() {
        TensorValue::new(&[3], TensorData::Int64(vec![1]));
    }
}
