use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::convert::Infallible;
use core::fmt;
use core::hash::{Hash, Hasher};

use crate::sharding::ShardingSpec;

/// Static type of an operator argument or return value.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ArgType {
    /// A single tensor.
    Tensor,
    /// A list of tensors.
    TensorList,
    /// A number of any kind.
    Scalar,
    /// An integer.
    Int,
    /// A list of integers.
    IntList,
    /// A floating point number.
    Float,
    /// A boolean.
    Bool,
    /// A string.
    Str,
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgType::Tensor => "Tensor",
            ArgType::TensorList => "Tensor[]",
            ArgType::Scalar => "Scalar",
            ArgType::Int => "int",
            ArgType::IntList => "int[]",
            ArgType::Float => "float",
            ArgType::Bool => "bool",
            ArgType::Str => "str",
        };
        f.write_str(name)
    }
}

/// One declared argument of a [`FunctionSchema`].
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct SchemaArgument {
    /// Argument name.
    pub name: String,
    /// Declared type.
    pub ty: ArgType,
    /// Whether the argument can only be passed by keyword.
    pub kwarg_only: bool,
}

/// Static signature of an operator overload.
///
/// ```rust
/// use burn_sharding::{ArgType, FunctionSchema};
///
/// let schema = FunctionSchema::new("aten::add", "Tensor")
///     .arg("self", ArgType::Tensor)
///     .arg("other", ArgType::Tensor)
///     .returns(ArgType::Tensor);
/// assert_eq!(schema.to_string(), "aten::add.Tensor(Tensor self, Tensor other) -> Tensor");
/// ```
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct FunctionSchema {
    name: String,
    overload_name: String,
    arguments: Vec<SchemaArgument>,
    returns: Vec<ArgType>,
}

impl FunctionSchema {
    /// Creates a schema without arguments or return values.
    pub fn new<N: Into<String>, O: Into<String>>(name: N, overload_name: O) -> Self {
        Self {
            name: name.into(),
            overload_name: overload_name.into(),
            arguments: Vec::new(),
            returns: Vec::new(),
        }
    }

    /// Appends a positional argument.
    pub fn arg<N: Into<String>>(mut self, name: N, ty: ArgType) -> Self {
        self.arguments.push(SchemaArgument {
            name: name.into(),
            ty,
            kwarg_only: false,
        });
        self
    }

    /// Appends a keyword-only argument.
    pub fn kwarg<N: Into<String>>(mut self, name: N, ty: ArgType) -> Self {
        self.arguments.push(SchemaArgument {
            name: name.into(),
            ty,
            kwarg_only: true,
        });
        self
    }

    /// Appends a return value.
    pub fn returns(mut self, ty: ArgType) -> Self {
        self.returns.push(ty);
        self
    }

    /// Operator name, including its namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overload name; empty for the default overload.
    pub fn overload_name(&self) -> &str {
        &self.overload_name
    }

    /// Declared arguments.
    pub fn arguments(&self) -> &[SchemaArgument] {
        &self.arguments
    }

    /// Declared return types.
    pub fn return_types(&self) -> &[ArgType] {
        &self.returns
    }
}

impl fmt::Display for FunctionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.overload_name.is_empty() {
            write!(f, ".{}", self.overload_name)?;
        }

        f.write_str("(")?;
        let mut kwarg_marker = false;
        for (idx, argument) in self.arguments.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            if argument.kwarg_only && !kwarg_marker {
                f.write_str("*, ")?;
                kwarg_marker = true;
            }
            write!(f, "{} {}", argument.ty, argument.name)?;
        }
        f.write_str(") -> ")?;

        match self.returns.as_slice() {
            [] => f.write_str("()"),
            [single] => write!(f, "{single}"),
            returns => {
                f.write_str("(")?;
                for (idx, ty) in returns.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{ty}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Identity of an operator overload.
///
/// Cheap to clone; equality and hashing use the qualified name
/// (`namespace::name.overload`), so two handles built for the same overload are the
/// same key.
#[derive(Clone, Debug)]
pub struct OpOverload {
    schema: Arc<FunctionSchema>,
}

impl OpOverload {
    /// Creates an operator identity from its signature.
    pub fn new(schema: FunctionSchema) -> Self {
        Self {
            schema: Arc::new(schema),
        }
    }

    /// Static signature of this operator.
    pub fn schema(&self) -> &FunctionSchema {
        &self.schema
    }
}

impl PartialEq for OpOverload {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.schema, &other.schema)
            || (self.schema.name() == other.schema.name()
                && self.schema.overload_name() == other.schema.overload_name())
    }
}

impl Eq for OpOverload {}

impl Hash for OpOverload {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.schema.name().hash(state);
        self.schema.overload_name().hash(state);
    }
}

impl fmt::Display for OpOverload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.schema.name())?;
        if !self.schema.overload_name().is_empty() {
            write!(f, ".{}", self.schema.overload_name())?;
        }
        Ok(())
    }
}

/// A non-tensor argument value.
///
/// Floats compare and hash by bit pattern so that schemas holding them are valid map keys.
#[derive(Clone, Debug)]
pub enum Scalar {
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// String.
    Str(String),
}

impl Scalar {
    /// Numeric value as `f64`, if this scalar is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(value) => Some(*value as f64),
            Scalar::Float(value) => Some(*value),
            Scalar::Bool(_) | Scalar::Str(_) => None,
        }
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::Int(lhs), Scalar::Int(rhs)) => lhs == rhs,
            (Scalar::Float(lhs), Scalar::Float(rhs)) => lhs.to_bits() == rhs.to_bits(),
            (Scalar::Bool(lhs), Scalar::Bool(rhs)) => lhs == rhs,
            (Scalar::Str(lhs), Scalar::Str(rhs)) => lhs == rhs,
            _ => false,
        }
    }
}

impl Eq for Scalar {}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            Scalar::Int(value) => value.hash(state),
            Scalar::Float(value) => value.to_bits().hash(state),
            Scalar::Bool(value) => value.hash(state),
            Scalar::Str(value) => value.hash(state),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(value) => write!(f, "{value}"),
            Scalar::Float(value) => write!(f, "{value:?}"),
            Scalar::Bool(value) => write!(f, "{value}"),
            Scalar::Str(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Str(value.into())
    }
}

/// An argument tree whose tensor leaves are `T`.
///
/// The same shape is used for operand specs (`Arg<ShardingSpec>`), fake tensors, graph
/// references and traced values. Tensors and scalars are leaves; lists are containers
/// and [`Arg::None`] holds nothing.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Arg<T> {
    /// A tensor operand.
    Tensor(T),
    /// A non-tensor value.
    Scalar(Scalar),
    /// An ordered container of arguments.
    List(Vec<Arg<T>>),
    /// An absent optional argument.
    None,
}

impl<T> Arg<T> {
    /// The tensor, if this argument is a tensor leaf.
    pub fn tensor(&self) -> Option<&T> {
        match self {
            Arg::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    /// The scalar, if this argument is a scalar leaf.
    pub fn scalar(&self) -> Option<&Scalar> {
        match self {
            Arg::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }

    /// Appends the leaves of this tree to `leaves`, depth first.
    pub fn flatten_into<'a>(&'a self, leaves: &mut Vec<&'a Arg<T>>) {
        match self {
            Arg::Tensor(_) | Arg::Scalar(_) => leaves.push(self),
            Arg::List(items) => items.iter().for_each(|item| item.flatten_into(leaves)),
            Arg::None => {}
        }
    }

    /// Leaves of this tree, depth first.
    pub fn leaves(&self) -> Vec<&Arg<T>> {
        let mut leaves = Vec::new();
        self.flatten_into(&mut leaves);
        leaves
    }

    /// Rebuilds the tree, transforming tensor leaves with `f` and keeping everything else.
    pub fn try_map<U, E, F>(&self, f: &mut F) -> Result<Arg<U>, E>
    where
        F: FnMut(&T) -> Result<U, E>,
    {
        match self {
            Arg::Tensor(tensor) => Ok(Arg::Tensor(f(tensor)?)),
            Arg::Scalar(scalar) => Ok(Arg::Scalar(scalar.clone())),
            Arg::List(items) => {
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    mapped.push(item.try_map(f)?);
                }
                Ok(Arg::List(mapped))
            }
            Arg::None => Ok(Arg::None),
        }
    }

    /// Infallible version of [`Arg::try_map`].
    pub fn map<U, F>(&self, mut f: F) -> Arg<U>
    where
        F: FnMut(&T) -> U,
    {
        match self.try_map(&mut |tensor| Ok::<U, Infallible>(f(tensor))) {
            Ok(mapped) => mapped,
            Err(never) => match never {},
        }
    }
}

impl<T: fmt::Display> fmt::Display for Arg<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Tensor(tensor) => write!(f, "{tensor}"),
            Arg::Scalar(scalar) => write!(f, "{scalar}"),
            Arg::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Arg::None => f.write_str("None"),
        }
    }
}

/// Flattens positional then keyword arguments (in key order) into one leaf sequence.
pub fn flatten_args<'a, T>(args: &'a [Arg<T>], kwargs: &'a BTreeMap<String, Arg<T>>) -> Vec<&'a Arg<T>> {
    let mut leaves = Vec::new();
    args.iter().for_each(|arg| arg.flatten_into(&mut leaves));
    kwargs.values().for_each(|arg| arg.flatten_into(&mut leaves));
    leaves
}

/// Snapshot of one operator call: its signature plus the specs of its actual arguments.
///
/// Used both as the input of sharding propagation and as the key of the propagation
/// cache. Two schemas are equal iff their operator and argument trees are structurally
/// equal.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct OpSchema {
    op: OpOverload,
    args_schema: Vec<Arg<ShardingSpec>>,
    kwargs_schema: BTreeMap<String, Arg<ShardingSpec>>,
}

impl OpSchema {
    /// Creates a schema.
    pub fn new(
        op: OpOverload,
        args_schema: Vec<Arg<ShardingSpec>>,
        kwargs_schema: BTreeMap<String, Arg<ShardingSpec>>,
    ) -> Self {
        Self {
            op,
            args_schema,
            kwargs_schema,
        }
    }

    /// Operator being called.
    pub fn op(&self) -> &OpOverload {
        &self.op
    }

    /// Static signature of the operator being called.
    pub fn func_schema(&self) -> &FunctionSchema {
        self.op.schema()
    }

    /// Positional arguments.
    pub fn args_schema(&self) -> &[Arg<ShardingSpec>] {
        &self.args_schema
    }

    /// Keyword arguments.
    pub fn kwargs_schema(&self) -> &BTreeMap<String, Arg<ShardingSpec>> {
        &self.kwargs_schema
    }

    /// The spec of the positional argument at `idx`, if it is a tensor.
    pub fn arg_spec(&self, idx: usize) -> Option<&ShardingSpec> {
        self.args_schema.get(idx).and_then(Arg::tensor)
    }

    /// Specs of all top-level positional tensor arguments, with their positions.
    pub fn arg_specs(&self) -> impl Iterator<Item = (usize, &ShardingSpec)> {
        self.args_schema
            .iter()
            .enumerate()
            .filter_map(|(idx, arg)| arg.tensor().map(|spec| (idx, spec)))
    }

    /// All argument leaves, positional first, then keyword arguments in key order.
    pub fn flat_args_sharding(&self) -> Vec<&Arg<ShardingSpec>> {
        flatten_args(&self.args_schema, &self.kwargs_schema)
    }

    /// Same call with other positional arguments.
    pub fn with_args(&self, args_schema: Vec<Arg<ShardingSpec>>) -> Self {
        Self {
            op: self.op.clone(),
            args_schema,
            kwargs_schema: self.kwargs_schema.clone(),
        }
    }

    /// Same call with some tensor leaves replaced.
    ///
    /// `replacements` is keyed by leaf position in [`OpSchema::flat_args_sharding`]
    /// order. Positions of non-tensor leaves are ignored.
    pub fn with_flat_args(&self, replacements: &BTreeMap<usize, ShardingSpec>) -> Self {
        let mut position = 0;
        let args_schema = self
            .args_schema
            .iter()
            .map(|arg| replace_leaves(arg, &mut position, replacements))
            .collect();
        let kwargs_schema = self
            .kwargs_schema
            .iter()
            .map(|(name, arg)| (name.clone(), replace_leaves(arg, &mut position, replacements)))
            .collect();

        Self {
            op: self.op.clone(),
            args_schema,
            kwargs_schema,
        }
    }
}

fn replace_leaves(
    arg: &Arg<ShardingSpec>,
    position: &mut usize,
    replacements: &BTreeMap<usize, ShardingSpec>,
) -> Arg<ShardingSpec> {
    match arg {
        Arg::Tensor(spec) => {
            let spec = replacements.get(&*position).unwrap_or(spec).clone();
            *position += 1;
            Arg::Tensor(spec)
        }
        Arg::Scalar(scalar) => {
            *position += 1;
            Arg::Scalar(scalar.clone())
        }
        Arg::List(items) => Arg::List(
            items
                .iter()
                .map(|item| replace_leaves(item, position, replacements))
                .collect(),
        ),
        Arg::None => Arg::None,
    }
}

impl fmt::Display for OpSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpSchema(op={}, args=(", self.op)?;
        for (idx, arg) in self.args_schema.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str("), kwargs={")?;
        for (idx, (name, arg)) in self.kwargs_schema.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {arg}")?;
        }
        f.write_str("})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::{DeviceMesh, MeshDim, Placement};
    use alloc::string::ToString;
    use alloc::vec;
    use hashbrown::HashSet;

    fn spec(placement: Placement) -> ShardingSpec {
        let mesh = Arc::new(DeviceMesh::new_1d(vec![0, 1], MeshDim::new("tp")).unwrap());
        ShardingSpec::new(mesh, vec![placement]).unwrap()
    }

    fn cat() -> OpOverload {
        OpOverload::new(
            FunctionSchema::new("aten::cat", "")
                .arg("tensors", ArgType::TensorList)
                .kwarg("dim", ArgType::Int)
                .returns(ArgType::Tensor),
        )
    }

    #[test]
    fn test_function_schema_display() {
        let schema = FunctionSchema::new("aten::split", "Tensor")
            .arg("self", ArgType::Tensor)
            .kwarg("split_size", ArgType::Int)
            .kwarg("dim", ArgType::Int)
            .returns(ArgType::Tensor)
            .returns(ArgType::Tensor);

        assert_eq!(
            schema.to_string(),
            "aten::split.Tensor(Tensor self, *, int split_size, int dim) -> (Tensor, Tensor)"
        );
        assert_eq!(cat().to_string(), "aten::cat");
    }

    #[test]
    fn test_flatten_order_args_then_kwargs() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("dim".to_string(), Arg::Scalar(Scalar::Int(0)));
        let schema = OpSchema::new(
            cat(),
            vec![Arg::List(vec![
                Arg::Tensor(spec(Placement::Shard(0))),
                Arg::None,
                Arg::Tensor(spec(Placement::Replicate)),
            ])],
            kwargs,
        );

        let flat = schema.flat_args_sharding();

        assert_eq!(flat.len(), 3);
        assert_eq!(flat[0], &Arg::Tensor(spec(Placement::Shard(0))));
        assert_eq!(flat[1], &Arg::Tensor(spec(Placement::Replicate)));
        assert_eq!(flat[2], &Arg::Scalar(Scalar::Int(0)));
    }

    #[test]
    fn test_with_flat_args_replaces_by_leaf_position() {
        let schema = OpSchema::new(
            cat(),
            vec![Arg::List(vec![
                Arg::Tensor(spec(Placement::Shard(0))),
                Arg::None,
                Arg::Tensor(spec(Placement::Shard(0))),
            ])],
            BTreeMap::new(),
        );
        let mut replacements = BTreeMap::new();
        replacements.insert(1, spec(Placement::Replicate));

        let replaced = schema.with_flat_args(&replacements);

        assert_eq!(
            replaced.args_schema(),
            &[Arg::List(vec![
                Arg::Tensor(spec(Placement::Shard(0))),
                Arg::None,
                Arg::Tensor(spec(Placement::Replicate)),
            ])]
        );
        assert_eq!(schema.with_flat_args(&BTreeMap::new()), schema);
    }

    #[test]
    fn test_schema_equality_is_structural() {
        let lhs = OpSchema::new(cat(), vec![Arg::Tensor(spec(Placement::Shard(0)))], BTreeMap::new());
        let rhs = OpSchema::new(cat(), vec![Arg::Tensor(spec(Placement::Shard(0)))], BTreeMap::new());
        let other = lhs.with_args(vec![Arg::Tensor(spec(Placement::Replicate))]);

        let mut keys = HashSet::new();
        keys.insert(lhs.clone());

        assert_eq!(lhs, rhs);
        assert!(keys.contains(&rhs));
        assert!(!keys.contains(&other));
    }

    #[test]
    fn test_scalar_float_keys() {
        assert_eq!(Scalar::Float(f64::NAN), Scalar::Float(f64::NAN));
        assert_ne!(Scalar::Float(1.0), Scalar::Int(1));
        assert_eq!(Scalar::from(2.5).as_f64(), Some(2.5));
        assert_eq!(Scalar::from("mean").to_string(), "\"mean\"");
    }

    #[test]
    fn test_arg_map_keeps_structure() {
        let arg = Arg::List(vec![Arg::Tensor(3usize), Arg::Scalar(Scalar::Bool(true)), Arg::None]);

        let mapped = arg.map(|value| value * 2);

        assert_eq!(
            mapped,
            Arg::List(vec![Arg::Tensor(6usize), Arg::Scalar(Scalar::Bool(true)), Arg::None])
        );
    }
}
