//! Compile options passed explicitly to each graph pass.

use rustc_hash::FxHashMap;

use crate::env::str_as_bool;

/// User input shapes, eg. `"data0:-1,3;data1:-1,4"`.
pub const OPTION_INPUT_SHAPE: &str = "ge.inputShape";

/// Gears for arbitrary unknown dims, eg. `"2,3;4,5"`.
pub const OPTION_DYNAMIC_DIMS: &str = "ge.dynamicDims";

/// Gears for a single unknown batch dim, eg. `"1,2,4"`.
pub const OPTION_DYNAMIC_BATCH_SIZE: &str = "ge.dynamicBatchSize";

/// Gears for unknown height and width dims, eg. `"224,224;448,448"`.
pub const OPTION_DYNAMIC_IMAGE_SIZE: &str = "ge.dynamicImageSize";

/// Kind of node the dynamic gears apply to, eg. `"0"` for Data nodes.
pub const OPTION_DYNAMIC_NODE_TYPE: &str = "ge.dynamicNodeType";

/// Whether the model executes on heterogeneous devices.
pub const OPTION_HETEROGENEOUS: &str = "ge.exec.heterogeneous";

/// String-keyed compile options.
///
/// The context is created by the caller and passed to every pass. Passes
/// only read options. Missing options read as empty strings.
#[derive(Clone, Debug, Default)]
pub struct CompileContext {
    options: FxHashMap<String, String>,
}

impl CompileContext {
    pub fn new() -> CompileContext {
        CompileContext::default()
    }

    /// Create a context from `(key, value)` pairs.
    pub fn from_options<K, V, I>(options: I) -> CompileContext
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        CompileContext {
            options: options
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Return a copy of this context with an option set.
    pub fn with_option(mut self, key: &str, value: &str) -> CompileContext {
        self.set_option(key, value);
        self
    }

    pub fn set_option(&mut self, key: &str, value: &str) {
        self.options.insert(key.to_string(), value.to_string());
    }

    /// Return the value of an option, or an empty string if it is not set.
    pub fn option(&self, key: &str) -> &str {
        self.options.get(key).map(|s| s.as_str()).unwrap_or_default()
    }

    pub fn input_shape(&self) -> &str {
        self.option(OPTION_INPUT_SHAPE)
    }

    pub fn dynamic_dims(&self) -> &str {
        self.option(OPTION_DYNAMIC_DIMS)
    }

    pub fn dynamic_batch_size(&self) -> &str {
        self.option(OPTION_DYNAMIC_BATCH_SIZE)
    }

    pub fn dynamic_image_size(&self) -> &str {
        self.option(OPTION_DYNAMIC_IMAGE_SIZE)
    }

    pub fn dynamic_node_type(&self) -> &str {
        self.option(OPTION_DYNAMIC_NODE_TYPE)
    }

    pub fn is_heterogeneous(&self) -> bool {
        str_as_bool(self.option(OPTION_HETEROGENEOUS))
    }

    /// Return true if the user configured dynamic gears through any of the
    /// dims, batch size or image size options.
    pub fn is_dynamic_config(&self) -> bool {
        !self.dynamic_dims().is_empty()
            || !self.dynamic_batch_size().is_empty()
            || !self.dynamic_image_size().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CompileContext, OPTION_DYNAMIC_BATCH_SIZE, OPTION_DYNAMIC_DIMS, OPTION_HETEROGENEOUS,
        OPTION_INPUT_SHAPE,
    };

    #[test]
    fn test_missing_options_are_empty() {
        let ctx = CompileContext::new();
        assert_eq!(ctx.input_shape(), "");
        assert!(!ctx.is_heterogeneous());
        assert!(!ctx.is_dynamic_config());
    }

    #[test]
    fn test_from_options() {
        let ctx = CompileContext::from_options([
            (OPTION_INPUT_SHAPE, "data0:-1,3"),
            (OPTION_DYNAMIC_DIMS, "1;2"),
            (OPTION_HETEROGENEOUS, "1"),
        ]);
        assert_eq!(ctx.input_shape(), "data0:-1,3");
        assert_eq!(ctx.dynamic_dims(), "1;2");
        assert!(ctx.is_heterogeneous());
        assert!(ctx.is_dynamic_config());
    }

    #[test]
    fn test_dynamic_config_from_batch_size() {
        let ctx = CompileContext::new().with_option(OPTION_DYNAMIC_BATCH_SIZE, "1,2");
        assert!(ctx.is_dynamic_config());
    }
}
