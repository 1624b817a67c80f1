//! Parsing of the multi-batch / dynamic-dims options.
//!
//! The input shape option lists named shapes in which `-1` marks an unknown
//! dim. The gear options (`dynamic dims`, `dynamic batch size` or `dynamic
//! image size`) list the concrete values each unknown dim takes in each
//! gear, flattened across all shapes in order.

use std::fmt;

use crate::context::CompileContext;
use crate::graph::UNKNOWN_DIM;

/// Maximum number of gears a model may declare.
pub const MAX_GEAR_COUNT: usize = 100;

/// A named input shape, where dims may be [`UNKNOWN_DIM`].
#[derive(Clone, Debug, PartialEq)]
pub struct ShapeSpec {
    pub name: String,
    pub dims: Vec<i64>,
}

impl ShapeSpec {
    pub fn new(name: &str, dims: &[i64]) -> ShapeSpec {
        ShapeSpec {
            name: name.to_string(),
            dims: dims.to_vec(),
        }
    }

    /// Number of unknown dims in this shape.
    pub fn unknown_count(&self) -> usize {
        self.dims.iter().filter(|&&d| d == UNKNOWN_DIM).count()
    }
}

/// The parsed gears of a gear option.
///
/// Each gear supplies one value per unknown dim across all shapes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GearSet {
    /// Raw per-gear tokens, as written in the option.
    pub tokens: Vec<Vec<String>>,

    /// Parsed per-gear values.
    pub gears: Vec<Vec<i64>>,
}

impl GearSet {
    pub fn len(&self) -> usize {
        self.gears.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gears.is_empty()
    }
}

/// Per-input result of [`build_subgraph_multi_dims_input`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubgraphMultiDimsInput {
    /// One `"<input index>:<dims>"` string per gear, giving the input's full
    /// shape in that gear.
    pub shape_strings: Vec<String>,

    /// The full shapes of all gears, concatenated with `,`.
    pub dims_string: String,
}

impl SubgraphMultiDimsInput {
    /// Return true if the input has no unknown dims and needs no gears.
    pub fn is_empty(&self) -> bool {
        self.shape_strings.is_empty()
    }
}

/// Result of [`parse_dynamic_shapes_and_dims`].
#[derive(Clone, Debug, PartialEq)]
pub struct DynamicShapeOptions {
    /// Input shapes in option order.
    pub shapes: Vec<ShapeSpec>,

    pub gears: GearSet,

    /// Input shapes with each unknown dim replaced by its maximum across
    /// gears.
    pub max_shapes: Vec<ShapeSpec>,

    /// Per-gear shapes of each input, parallel to `shapes`.
    pub inputs: Vec<SubgraphMultiDimsInput>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParseErrorKind {
    /// The option doesn't have the expected structure.
    InvalidFormat { message: String },

    /// A dim is not a valid integer for its position.
    InvalidDim { token: String },

    /// Shape names are not in strictly ascending order.
    UnsortedNames { prev: String, name: String },

    /// A gear has the wrong number of values.
    GearArity {
        gear: usize,
        expected: usize,
        actual: usize,
    },

    /// The number of gears is zero or exceeds [`MAX_GEAR_COUNT`].
    GearCount { count: usize },

    /// A gear repeats an earlier gear.
    DuplicateGear { gear: usize },

    /// More than one gear option is set.
    ConflictingOptions,

    /// Gears were given but the input shapes have no unknown dims.
    NoUnknownDims,
}

/// Error parsing an option string.
#[derive(Clone, Debug, PartialEq)]
pub struct ParseError {
    spec: String,
    kind: ParseErrorKind,
}

impl ParseError {
    fn new(spec: &str, kind: ParseErrorKind) -> ParseError {
        ParseError {
            spec: spec.to_string(),
            kind,
        }
    }

    fn invalid_format(spec: &str, message: &str) -> ParseError {
        ParseError::new(
            spec,
            ParseErrorKind::InvalidFormat {
                message: message.to_string(),
            },
        )
    }

    /// The option value which failed to parse.
    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn kind(&self) -> &ParseErrorKind {
        &self.kind
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ParseErrorKind::InvalidFormat { message } => {
                write!(fmt, "invalid format for \"{}\": {}", self.spec, message)
            }
            ParseErrorKind::InvalidDim { token } => {
                write!(fmt, "invalid dim \"{}\" in \"{}\"", token, self.spec)
            }
            ParseErrorKind::UnsortedNames { prev, name } => write!(
                fmt,
                "shape names in \"{}\" must be in ascending order but \"{}\" follows \"{}\"",
                self.spec, name, prev
            ),
            ParseErrorKind::GearArity {
                gear,
                expected,
                actual,
            } => write!(
                fmt,
                "gear {} in \"{}\" has {} values but there are {} unknown dims",
                gear, self.spec, actual, expected
            ),
            ParseErrorKind::GearCount { count } => write!(
                fmt,
                "\"{}\" has {} gears. Must be between 1 and {}.",
                self.spec, count, MAX_GEAR_COUNT
            ),
            ParseErrorKind::DuplicateGear { gear } => {
                write!(fmt, "gear {} in \"{}\" repeats an earlier gear", gear, self.spec)
            }
            ParseErrorKind::ConflictingOptions => write!(
                fmt,
                "only one of dynamic dims, batch size and image size may be set, got \"{}\"",
                self.spec
            ),
            ParseErrorKind::NoUnknownDims => {
                write!(fmt, "input shape \"{}\" has no unknown dims", self.spec)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Split `s` on `sep`, trimming tokens and skipping empty ones.
fn split_non_empty(s: &str, sep: char) -> impl Iterator<Item = &str> {
    s.split(sep).map(str::trim).filter(|tok| !tok.is_empty())
}

/// Parse a base-10 dim in a shape. `-1` is the only negative value allowed.
fn parse_shape_dim(spec: &str, token: &str) -> Result<i64, ParseError> {
    if token == "-1" {
        return Ok(UNKNOWN_DIM);
    }
    parse_gear_dim(spec, token)
}

/// Parse a base-10 non-negative dim.
fn parse_gear_dim(spec: &str, token: &str) -> Result<i64, ParseError> {
    let invalid = || {
        ParseError::new(
            spec,
            ParseErrorKind::InvalidDim {
                token: token.to_string(),
            },
        )
    };
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    token.parse().map_err(|_| invalid())
}

/// Parse an input shape option such as `"data0:-1,3;data1:-1,4"`.
///
/// Names must be in strictly ascending lexicographic order.
pub fn parse_dynamic_shapes(spec: &str) -> Result<Vec<ShapeSpec>, ParseError> {
    let mut shapes: Vec<ShapeSpec> = Vec::new();

    for entry in split_non_empty(spec, ';') {
        let parts: Vec<&str> = entry.split(':').collect();
        let [name, dims] = parts.as_slice() else {
            return Err(ParseError::invalid_format(
                spec,
                &format!("expected <name>:<dims> but found \"{}\"", entry),
            ));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError::invalid_format(spec, "shape name is empty"));
        }

        let dims = dims
            .split(',')
            .map(|tok| parse_shape_dim(spec, tok.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(prev) = shapes.last() {
            if prev.name.as_str() >= name {
                return Err(ParseError::new(
                    spec,
                    ParseErrorKind::UnsortedNames {
                        prev: prev.name.clone(),
                        name: name.to_string(),
                    },
                ));
            }
        }
        shapes.push(ShapeSpec::new(name, &dims));
    }

    if shapes.is_empty() {
        return Err(ParseError::invalid_format(spec, "no shapes given"));
    }
    Ok(shapes)
}

/// Parse gears separated by `;`, each with `arity` values separated by `,`.
fn parse_gears(spec: &str, arity: usize) -> Result<GearSet, ParseError> {
    let mut gear_set = GearSet::default();

    for (gear, entry) in split_non_empty(spec, ';').enumerate() {
        let tokens: Vec<String> = entry.split(',').map(|t| t.trim().to_string()).collect();
        if tokens.len() != arity {
            return Err(ParseError::new(
                spec,
                ParseErrorKind::GearArity {
                    gear,
                    expected: arity,
                    actual: tokens.len(),
                },
            ));
        }
        let values = tokens
            .iter()
            .map(|tok| parse_gear_dim(spec, tok))
            .collect::<Result<Vec<_>, _>>()?;

        if gear_set.gears.contains(&values) {
            return Err(ParseError::new(spec, ParseErrorKind::DuplicateGear { gear }));
        }
        gear_set.tokens.push(tokens);
        gear_set.gears.push(values);
    }

    let count = gear_set.len();
    if count == 0 || count > MAX_GEAR_COUNT {
        return Err(ParseError::new(spec, ParseErrorKind::GearCount { count }));
    }
    Ok(gear_set)
}

fn total_unknown_count(shapes: &[ShapeSpec]) -> usize {
    shapes.iter().map(|s| s.unknown_count()).sum()
}

/// Parse a dynamic dims option such as `"2,3;4,5"`.
///
/// Each `;`-separated gear must have exactly one value for each unknown dim
/// across `shapes`.
pub fn parse_dynamic_dims(spec: &str, shapes: &[ShapeSpec]) -> Result<GearSet, ParseError> {
    let unknown = total_unknown_count(shapes);
    if unknown == 0 {
        return Err(ParseError::new(spec, ParseErrorKind::NoUnknownDims));
    }
    parse_gears(spec, unknown)
}

/// Parse a dynamic batch size option such as `"1,2,4"`.
///
/// The shapes must have exactly one unknown dim. Each `,`-separated value is
/// one gear.
pub fn parse_dynamic_batch_size(spec: &str, shapes: &[ShapeSpec]) -> Result<GearSet, ParseError> {
    let unknown = total_unknown_count(shapes);
    if unknown != 1 {
        return Err(ParseError::invalid_format(
            spec,
            &format!("dynamic batch size needs 1 unknown dim, found {}", unknown),
        ));
    }
    let gears = split_non_empty(spec, ',').collect::<Vec<_>>().join(";");
    parse_gears(&gears, 1).map_err(|err| ParseError::new(spec, err.kind))
}

/// Parse a dynamic image size option such as `"224,224;448,448"`.
///
/// The shapes must have exactly two unknown dims, the height and width.
pub fn parse_dynamic_image_size(spec: &str, shapes: &[ShapeSpec]) -> Result<GearSet, ParseError> {
    let unknown = total_unknown_count(shapes);
    if unknown != 2 {
        return Err(ParseError::invalid_format(
            spec,
            &format!("dynamic image size needs 2 unknown dims, found {}", unknown),
        ));
    }
    parse_gears(spec, 2)
}

/// Compute the max shape of each input.
///
/// Each unknown dim is replaced by the maximum value any gear assigns to it.
/// Gear values are consumed in order across shapes, so the `k`th unknown dim
/// overall corresponds to the `k`th value of each gear.
pub fn parse_max_shape_range(shapes: &[ShapeSpec], gears: &[Vec<i64>]) -> Vec<ShapeSpec> {
    let mut position = 0;
    shapes
        .iter()
        .map(|shape| {
            let dims = shape
                .dims
                .iter()
                .map(|&dim| {
                    if dim != UNKNOWN_DIM {
                        return dim;
                    }
                    let max = gears
                        .iter()
                        .filter_map(|gear| gear.get(position).copied())
                        .max()
                        .unwrap_or(UNKNOWN_DIM);
                    position += 1;
                    max
                })
                .collect::<Vec<_>>();
            ShapeSpec::new(&shape.name, &dims)
        })
        .collect()
}

/// Join dims with `,`.
pub fn dims_to_string(dims: &[i64]) -> String {
    dims.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Compute the per-gear shapes of each input.
///
/// The result is parallel to `shapes`. Inputs without unknown dims get an
/// empty entry.
pub fn build_subgraph_multi_dims_input(
    shapes: &[ShapeSpec],
    gears: &[Vec<i64>],
) -> Vec<SubgraphMultiDimsInput> {
    let mut offset = 0;
    let mut inputs = Vec::with_capacity(shapes.len());

    for (index, shape) in shapes.iter().enumerate() {
        let unknown = shape.unknown_count();
        if unknown == 0 {
            inputs.push(SubgraphMultiDimsInput::default());
            continue;
        }

        let mut shape_strings = Vec::with_capacity(gears.len());
        let mut all_dims = Vec::with_capacity(gears.len());
        for gear in gears {
            let mut values = gear.iter().skip(offset);
            let dims: Vec<i64> = shape
                .dims
                .iter()
                .map(|&dim| match dim {
                    UNKNOWN_DIM => values.next().copied().unwrap_or(UNKNOWN_DIM),
                    dim => dim,
                })
                .collect();
            let dims = dims_to_string(&dims);
            shape_strings.push(format!("{}:{}", index, dims));
            all_dims.push(dims);
        }
        offset += unknown;

        inputs.push(SubgraphMultiDimsInput {
            shape_strings,
            dims_string: all_dims.join(","),
        });
    }
    inputs
}

/// Parse an `"<index>:<dims>"` string produced by
/// [`build_subgraph_multi_dims_input`].
pub fn parse_indexed_dims(spec: &str) -> Result<(usize, Vec<i64>), ParseError> {
    let Some((index, dims)) = spec.split_once(':') else {
        return Err(ParseError::invalid_format(spec, "expected <index>:<dims>"));
    };
    let index = parse_gear_dim(spec, index.trim())? as usize;
    let dims = parse_dims_list(dims)?;
    Ok((index, dims))
}

/// Parse a `,`-separated list of non-negative dims.
pub fn parse_dims_list(spec: &str) -> Result<Vec<i64>, ParseError> {
    spec.split(',')
        .map(|tok| parse_gear_dim(spec, tok.trim()))
        .collect()
}

/// Parse the input shape and whichever gear option is set.
///
/// Exactly one of the dynamic dims, dynamic batch size and dynamic image
/// size options must be set.
pub fn parse_dynamic_shapes_and_dims(
    ctx: &CompileContext,
) -> Result<DynamicShapeOptions, ParseError> {
    let shapes = parse_dynamic_shapes(ctx.input_shape())?;

    let gear_options = [
        ctx.dynamic_dims(),
        ctx.dynamic_batch_size(),
        ctx.dynamic_image_size(),
    ];
    let set_count = gear_options.iter().filter(|o| !o.is_empty()).count();
    if set_count > 1 {
        return Err(ParseError::new(
            &gear_options.join("|"),
            ParseErrorKind::ConflictingOptions,
        ));
    }

    let gears = match gear_options {
        [dims, _, _] if !dims.is_empty() => parse_dynamic_dims(dims, &shapes)?,
        [_, batch, _] if !batch.is_empty() => parse_dynamic_batch_size(batch, &shapes)?,
        [_, _, image] if !image.is_empty() => parse_dynamic_image_size(image, &shapes)?,
        _ => {
            return Err(ParseError::new("", ParseErrorKind::GearCount { count: 0 }));
        }
    };

    let max_shapes = parse_max_shape_range(&shapes, &gears.gears);
    let inputs = build_subgraph_multi_dims_input(&shapes, &gears.gears);

    Ok(DynamicShapeOptions {
        shapes,
        gears,
        max_shapes,
        inputs,
    })
}

#[cfg(test)]
mod tests {
    use gearshift_testing::TestCases;

    use super::{
        build_subgraph_multi_dims_input, parse_dynamic_batch_size, parse_dynamic_dims,
        parse_dynamic_image_size, parse_dynamic_shapes, parse_dynamic_shapes_and_dims,
        parse_indexed_dims, parse_max_shape_range, ParseErrorKind, ShapeSpec,
    };
    use crate::context::{
        CompileContext, OPTION_DYNAMIC_BATCH_SIZE, OPTION_DYNAMIC_DIMS, OPTION_INPUT_SHAPE,
    };

    fn shapes(spec: &str) -> Vec<ShapeSpec> {
        parse_dynamic_shapes(spec).unwrap()
    }

    #[test]
    fn test_parse_dynamic_shapes() {
        #[derive(Debug)]
        struct Case {
            spec: &'static str,
            expected: Result<Vec<ShapeSpec>, ParseErrorKind>,
        }

        let cases = [
            Case {
                spec: "data0:-1,3;data1:-1,4",
                expected: Ok(vec![
                    ShapeSpec::new("data0", &[-1, 3]),
                    ShapeSpec::new("data1", &[-1, 4]),
                ]),
            },
            Case {
                spec: "x:1,-1,224,224;",
                expected: Ok(vec![ShapeSpec::new("x", &[1, -1, 224, 224])]),
            },
            Case {
                spec: "data0-1,3",
                expected: Err(ParseErrorKind::InvalidFormat {
                    message: "expected <name>:<dims> but found \"data0-1,3\"".into(),
                }),
            },
            Case {
                spec: "data0:1:2",
                expected: Err(ParseErrorKind::InvalidFormat {
                    message: "expected <name>:<dims> but found \"data0:1:2\"".into(),
                }),
            },
            Case {
                spec: "data0:-1,3x",
                expected: Err(ParseErrorKind::InvalidDim { token: "3x".into() }),
            },
            Case {
                spec: "data0:-2,3",
                expected: Err(ParseErrorKind::InvalidDim { token: "-2".into() }),
            },
            Case {
                spec: "data1:-1;data0:-1",
                expected: Err(ParseErrorKind::UnsortedNames {
                    prev: "data1".into(),
                    name: "data0".into(),
                }),
            },
            Case {
                spec: "data0:-1;data0:-1",
                expected: Err(ParseErrorKind::UnsortedNames {
                    prev: "data0".into(),
                    name: "data0".into(),
                }),
            },
        ];

        cases.test_each(|case| {
            let result = parse_dynamic_shapes(case.spec).map_err(|err| err.kind().clone());
            assert_eq!(result, case.expected);
        })
    }

    #[test]
    fn test_parse_dynamic_dims() {
        #[derive(Debug)]
        struct Case {
            shapes: &'static str,
            dims: &'static str,
            expected: Result<Vec<Vec<i64>>, ParseErrorKind>,
        }

        let cases = [
            Case {
                shapes: "data0:-1,3;data1:-1,4",
                dims: "2,3;4,5",
                expected: Ok(vec![vec![2, 3], vec![4, 5]]),
            },
            Case {
                shapes: "data0:-1,-1",
                dims: "1,1;2,2;3,3",
                expected: Ok(vec![vec![1, 1], vec![2, 2], vec![3, 3]]),
            },
            Case {
                shapes: "data0:-1,3;data1:-1,4",
                dims: "2,3;4",
                expected: Err(ParseErrorKind::GearArity {
                    gear: 1,
                    expected: 2,
                    actual: 1,
                }),
            },
            Case {
                shapes: "data0:-1",
                dims: "2;-4",
                expected: Err(ParseErrorKind::InvalidDim { token: "-4".into() }),
            },
            Case {
                shapes: "data0:-1",
                dims: "2;2",
                expected: Err(ParseErrorKind::DuplicateGear { gear: 1 }),
            },
            Case {
                shapes: "data0:2,3",
                dims: "2;4",
                expected: Err(ParseErrorKind::NoUnknownDims),
            },
            Case {
                shapes: "data0:-1",
                dims: ";",
                expected: Err(ParseErrorKind::GearCount { count: 0 }),
            },
        ];

        cases.test_each(|case| {
            let result = parse_dynamic_dims(case.dims, &shapes(case.shapes))
                .map(|gears| gears.gears)
                .map_err(|err| err.kind().clone());
            assert_eq!(result, case.expected);
        })
    }

    #[test]
    fn test_gear_count_limit() {
        let dims: Vec<String> = (1..=101).map(|i| i.to_string()).collect();
        let err = parse_dynamic_dims(&dims.join(";"), &shapes("x:-1")).unwrap_err();
        assert_eq!(err.kind(), &ParseErrorKind::GearCount { count: 101 });
    }

    #[test]
    fn test_gear_arity_matches_unknown_count() {
        let shapes = shapes("a:-1,2;b:-1,-1;c:3");
        let gears = parse_dynamic_dims("1,2,3;4,5,6", &shapes).unwrap();
        let unknown: usize = shapes.iter().map(|s| s.unknown_count()).sum();
        assert!(gears.gears.iter().all(|g| g.len() == unknown));
        assert!(gears.tokens.iter().all(|g| g.len() == unknown));
    }

    #[test]
    fn test_parse_dynamic_batch_and_image_size() {
        let gears = parse_dynamic_batch_size("1,2,4", &shapes("x:-1,3")).unwrap();
        assert_eq!(gears.gears, [[1], [2], [4]]);

        let err = parse_dynamic_batch_size("1,2", &shapes("x:-1,-1")).unwrap_err();
        assert!(matches!(err.kind(), ParseErrorKind::InvalidFormat { .. }));
        assert_eq!(err.spec(), "1,2");

        let gears =
            parse_dynamic_image_size("224,224;448,448", &shapes("x:1,3,-1,-1")).unwrap();
        assert_eq!(gears.gears, [[224, 224], [448, 448]]);

        let err = parse_dynamic_image_size("224", &shapes("x:1,3,-1,-1")).unwrap_err();
        assert!(matches!(err.kind(), ParseErrorKind::GearArity { .. }));
    }

    #[test]
    fn test_parse_max_shape_range() {
        let shapes = shapes("data0:-1,3;data1:-1,4");
        let max = parse_max_shape_range(&shapes, &[vec![2, 3], vec![4, 5]]);
        assert_eq!(
            max,
            [ShapeSpec::new("data0", &[4, 3]), ShapeSpec::new("data1", &[5, 4])]
        );
    }

    #[test]
    fn test_build_subgraph_multi_dims_input() {
        let shapes = shapes("a:-1,3;b:2,2;c:-1,-1");
        let inputs = build_subgraph_multi_dims_input(&shapes, &[vec![1, 5, 6], vec![2, 7, 8]]);

        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[0].shape_strings, ["0:1,3", "0:2,3"]);
        assert_eq!(inputs[0].dims_string, "1,3,2,3");
        assert!(inputs[1].is_empty());
        assert_eq!(inputs[2].shape_strings, ["2:5,6", "2:7,8"]);
        assert_eq!(inputs[2].dims_string, "5,6,7,8");

        assert_eq!(parse_indexed_dims("2:7,8").unwrap(), (2, vec![7, 8]));
        assert!(parse_indexed_dims("7,8").is_err());
    }

    #[test]
    fn test_parse_dynamic_shapes_and_dims() {
        let ctx = CompileContext::new()
            .with_option(OPTION_INPUT_SHAPE, "data0:-1,3;data1:-1,4")
            .with_option(OPTION_DYNAMIC_DIMS, "2,3;4,5");

        let options = parse_dynamic_shapes_and_dims(&ctx).unwrap();

        assert_eq!(
            options.shapes,
            [
                ShapeSpec::new("data0", &[-1, 3]),
                ShapeSpec::new("data1", &[-1, 4])
            ]
        );
        assert_eq!(options.gears.tokens, [["2", "3"], ["4", "5"]]);
        assert_eq!(
            options.max_shapes,
            [ShapeSpec::new("data0", &[4, 3]), ShapeSpec::new("data1", &[5, 4])]
        );
        assert_eq!(options.inputs[0].shape_strings, ["0:2,3", "0:4,3"]);
        assert_eq!(options.inputs[1].shape_strings, ["1:3,4", "1:5,4"]);
    }

    #[test]
    fn test_conflicting_gear_options() {
        let ctx = CompileContext::new()
            .with_option(OPTION_INPUT_SHAPE, "data0:-1,3")
            .with_option(OPTION_DYNAMIC_DIMS, "1;2")
            .with_option(OPTION_DYNAMIC_BATCH_SIZE, "1,2");

        let err = parse_dynamic_shapes_and_dims(&ctx).unwrap_err();
        assert_eq!(err.kind(), &ParseErrorKind::ConflictingOptions);
    }
}
