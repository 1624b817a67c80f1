use std::num::NonZero;

/// ID of a node in a [`ComputeGraph`](crate::ComputeGraph).
///
/// Node IDs are allocated by the graph arena and are never reused within a
/// graph, so an ID held after its node was removed resolves to `None` rather
/// than to an unrelated node.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(NonZero<u32>);

/// ID of a graph (the root graph or a subgraph) in a
/// [`ComputeGraph`](crate::ComputeGraph).
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GraphId(NonZero<u32>);

macro_rules! impl_arena_id {
    ($id:ident, $label:literal) => {
        impl $id {
            /// Return the underlying u32 value of the ID.
            pub fn as_u32(self) -> u32 {
                self.0.get() - 1
            }

            /// Return the underlying ID value as a usize, for slice indexing.
            pub fn as_usize(self) -> usize {
                self.as_u32() as usize
            }

            /// Construct an ID from a u32 value.
            ///
            /// Panics if the value is `u32::MAX`.
            pub fn from_u32(value: u32) -> $id {
                // Values are stored offset by one, reserving 0 as a niche so
                // that `Option<Id>` is the same size as `Id`.
                let Some(stored) = value.checked_add(1).and_then(NonZero::new) else {
                    panic!("{} value {} out of range", $label, value);
                };
                $id(stored)
            }

            pub(crate) fn from_usize(value: usize) -> $id {
                let value = u32::try_from(value).expect("arena index should fit in u32");
                Self::from_u32(value)
            }
        }

        impl std::fmt::Display for $id {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.as_u32().fmt(f)
            }
        }

        impl std::fmt::Debug for $id {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", $label, self.as_u32())
            }
        }
    };
}

impl_arena_id!(NodeId, "NodeId");
impl_arena_id!(GraphId, "GraphId");

#[cfg(test)]
mod tests {
    use super::{GraphId, NodeId};

    #[test]
    fn test_id_round_trip() {
        let id = NodeId::from_u32(42);
        assert_eq!(id.as_u32(), 42);
        assert_eq!(id.as_usize(), 42);
        assert_eq!(format!("{:?}", id), "NodeId(42)");
        assert_eq!(format!("{}", GraphId::from_u32(0)), "0");
    }

    #[test]
    fn test_option_id_has_niche() {
        assert_eq!(
            std::mem::size_of::<Option<NodeId>>(),
            std::mem::size_of::<NodeId>()
        );
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_id_out_of_range() {
        NodeId::from_u32(u32::MAX);
    }
}
