//! Type contexts for block versioning.
//!
//! A [`Context`] describes what the compiler knows about the operand stack,
//! the local variables and `self` at one point in a bytecode sequence. Each
//! compiled block records the context it was compiled under; the diff
//! functions decide whether a block compiled under one context can serve a
//! request made under another.

use crate::config::Options;

/// Maximum number of temp value types we keep track of
pub const MAX_TEMP_TYPES: usize = 8;

/// Maximum number of local variable types we keep track of
pub const MAX_LOCAL_TYPES: usize = 8;

/// What the compiler knows about a runtime value.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub enum Type {
    #[default]
    Unknown,
    UnknownImm,
    UnknownHeap,
    Nil,
    True,
    False,
    Fixnum,
    Array,
    Str,
}

impl Type {
    /// Check if the type is an immediate
    pub fn is_imm(&self) -> bool {
        matches!(
            self,
            Type::UnknownImm | Type::Nil | Type::True | Type::False | Type::Fixnum
        )
    }

    /// Returns true when the type is not specific.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Type::Unknown | Type::UnknownImm | Type::UnknownHeap)
    }

    /// Check if the type is a heap object
    pub fn is_heap(&self) -> bool {
        matches!(self, Type::UnknownHeap | Type::Array | Type::Str)
    }

    /// Whether values of this type are always truthy or always falsy,
    /// if that is known.
    pub fn known_truthy(&self) -> Option<bool> {
        match self {
            Type::Nil | Type::False => Some(false),
            Type::UnknownHeap | Type::True | Type::Fixnum | Type::Array | Type::Str => Some(true),
            Type::Unknown | Type::UnknownImm => None,
        }
    }

    /// Compute a difference between two value types. `self` is the type we
    /// have, `dst` is the type a compiled block expects.
    pub fn diff(self, dst: Self) -> TypeDiff {
        // Perfect match, difference is zero
        if self == dst {
            return TypeDiff::Compatible(0);
        }

        // Any type can flow into an unknown type
        if dst == Type::Unknown {
            return TypeDiff::Compatible(1);
        }

        // Specific heap type into unknown heap type is imperfect but valid
        if self.is_heap() && dst == Type::UnknownHeap {
            return TypeDiff::Compatible(1);
        }

        // Specific immediate type into unknown immediate type is imperfect but valid
        if self.is_imm() && dst == Type::UnknownImm {
            return TypeDiff::Compatible(1);
        }

        TypeDiff::Incompatible
    }

    /// Upgrade this type into a more specific compatible type.
    /// The new type must be at least as specific as the current one.
    fn upgrade(&mut self, new_type: Self) {
        assert!(new_type.diff(*self) != TypeDiff::Incompatible);
        *self = new_type;
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum TypeDiff {
    // 0: same. Larger values are compatible but less of a match.
    Compatible(usize),
    Incompatible,
}

/// Where a tracked stack temp gets its value from. A temp that aliases
/// `self` or a local reads and writes its type through the backing store.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TempMapping {
    /// Plain stack value with its own tracked type
    MapToStack(Type),
    /// Alias of `self`
    MapToSelf,
    /// Alias of a local variable
    MapToLocal(u8),
}

impl Default for TempMapping {
    fn default() -> Self {
        TempMapping::MapToStack(Type::Unknown)
    }
}

impl TempMapping {
    /// The same mapping with any directly-held type erased
    pub fn without_type(&self) -> TempMapping {
        match self {
            TempMapping::MapToStack(_) => TempMapping::MapToStack(Type::Unknown),
            other => *other,
        }
    }

    /// Whether two mappings agree on provenance, ignoring tracked types
    fn same_kind(&self, other: &TempMapping) -> bool {
        self.without_type() == other.without_type()
    }
}

/// Refers to either `self` or a slot on the operand stack.
/// `StackOpnd(0)` is the top of the stack.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InsnOpnd {
    SelfOpnd,
    StackOpnd(u8),
}

/// Code generation context. Contexts are plain values: copied freely and
/// never mutated once attached to a compiled block.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct Context {
    /// Number of values currently on the temporary stack
    pub stack_size: u8,

    /// Offset of the JIT stack top relative to the interpreter's
    /// stack pointer field, in slots
    pub sp_offset: i8,

    /// Depth of this block in a speculation side chain.
    /// Bounds the number of retries at one bytecode location.
    pub chain_depth: u8,

    /// Type of the `self` value
    pub self_type: Type,

    /// Types of the first few local variables
    pub local_types: [Type; MAX_LOCAL_TYPES],

    /// Provenance and type of the first few stack temps
    pub temp_mapping: [TempMapping; MAX_TEMP_TYPES],
}

impl Context {
    /// A context carrying no type information, with a given stack shape.
    /// Used as the universal fallback once the version cap is reached.
    pub fn generic(stack_size: u8, sp_offset: i8) -> Context {
        Context {
            stack_size,
            sp_offset,
            ..Default::default()
        }
    }

    /// Push one value on the tracked stack with an explicit mapping
    pub fn stack_push_mapping(&mut self, opts: &Options, mapping: TempMapping) {
        // If type learning is disabled, store no types
        let mapping = if opts.no_type_prop {
            mapping.without_type()
        } else {
            mapping
        };

        let stack_size = self.stack_size as usize;
        if stack_size < MAX_TEMP_TYPES {
            if let TempMapping::MapToLocal(idx) = mapping {
                assert!((idx as usize) < MAX_LOCAL_TYPES);
            }
            self.temp_mapping[stack_size] = mapping;
        }

        self.stack_size += 1;
        self.sp_offset += 1;
    }

    /// Push one value of a known type on the tracked stack
    pub fn stack_push(&mut self, opts: &Options, val_type: Type) {
        self.stack_push_mapping(opts, TempMapping::MapToStack(val_type));
    }

    /// Push the `self` value on the tracked stack
    pub fn stack_push_self(&mut self, opts: &Options) {
        self.stack_push_mapping(opts, TempMapping::MapToSelf);
    }

    /// Push a local variable on the tracked stack
    pub fn stack_push_local(&mut self, opts: &Options, local_idx: usize) {
        if local_idx >= MAX_LOCAL_TYPES {
            self.stack_push(opts, Type::Unknown);
            return;
        }

        self.stack_push_mapping(opts, TempMapping::MapToLocal(local_idx as u8));
    }

    /// Pop N values off the tracked stack. The popped slots go back to
    /// untyped plain-stack state so a later push starts clean.
    pub fn stack_pop(&mut self, n: usize) {
        assert!(n <= self.stack_size.into());

        for i in 0..n {
            let idx = (self.stack_size as usize) - i - 1;
            if idx < MAX_TEMP_TYPES {
                self.temp_mapping[idx] = TempMapping::MapToStack(Type::Unknown);
            }
        }

        self.stack_size -= n as u8;
        self.sp_offset -= n as i8;
    }

    /// Get the type of an instruction operand, following provenance
    pub fn get_opnd_type(&self, opnd: InsnOpnd) -> Type {
        match opnd {
            InsnOpnd::SelfOpnd => self.self_type,
            InsnOpnd::StackOpnd(idx) => {
                assert!(idx < self.stack_size);
                let stack_idx = (self.stack_size - 1 - idx) as usize;

                // Slots outside the tracked range are unknown
                if stack_idx >= MAX_TEMP_TYPES {
                    return Type::Unknown;
                }

                match self.temp_mapping[stack_idx] {
                    TempMapping::MapToSelf => self.self_type,
                    TempMapping::MapToStack(ty) => ty,
                    TempMapping::MapToLocal(idx) => self.get_local_type(idx.into()),
                }
            }
        }
    }

    /// Get the tracked type of a local variable
    pub fn get_local_type(&self, local_idx: usize) -> Type {
        if local_idx >= MAX_LOCAL_TYPES {
            Type::Unknown
        } else {
            self.local_types[local_idx]
        }
    }

    /// Get both the provenance and type of an operand
    pub fn get_opnd_mapping(&self, opnd: InsnOpnd) -> TempMapping {
        let opnd_type = self.get_opnd_type(opnd);

        match opnd {
            InsnOpnd::SelfOpnd => TempMapping::MapToSelf,
            InsnOpnd::StackOpnd(idx) => {
                assert!(idx < self.stack_size);
                let stack_idx = (self.stack_size - 1 - idx) as usize;

                if stack_idx < MAX_TEMP_TYPES {
                    self.temp_mapping[stack_idx]
                } else {
                    // Untracked slot, necessarily unknown
                    assert!(opnd_type == Type::Unknown);
                    TempMapping::MapToStack(opnd_type)
                }
            }
        }
    }

    /// Overwrite both the provenance and type of a stack operand
    pub fn set_opnd_mapping(&mut self, opts: &Options, opnd: InsnOpnd, mapping: TempMapping) {
        match opnd {
            InsnOpnd::SelfOpnd => unreachable!("self always maps to self"),
            InsnOpnd::StackOpnd(idx) => {
                assert!(idx < self.stack_size);
                let stack_idx = (self.stack_size - 1 - idx) as usize;

                if opts.no_type_prop {
                    return;
                }

                if stack_idx >= MAX_TEMP_TYPES {
                    return;
                }

                self.temp_mapping[stack_idx] = mapping;
            }
        }
    }

    /// Learn the type of an instruction operand. The new type must be
    /// compatible and at least as specific as the previously known type.
    /// A type learned through an alias propagates back to its source.
    pub fn upgrade_opnd_type(&mut self, opts: &Options, opnd: InsnOpnd, opnd_type: Type) {
        if opts.no_type_prop {
            return;
        }

        match opnd {
            InsnOpnd::SelfOpnd => self.self_type.upgrade(opnd_type),
            InsnOpnd::StackOpnd(idx) => {
                assert!(idx < self.stack_size);
                let stack_idx = (self.stack_size - 1 - idx) as usize;

                if stack_idx >= MAX_TEMP_TYPES {
                    return;
                }

                match self.temp_mapping[stack_idx] {
                    TempMapping::MapToSelf => self.self_type.upgrade(opnd_type),
                    TempMapping::MapToStack(mut temp_type) => {
                        temp_type.upgrade(opnd_type);
                        self.temp_mapping[stack_idx] = TempMapping::MapToStack(temp_type);
                    }
                    TempMapping::MapToLocal(local_idx) => {
                        let local_idx = local_idx as usize;
                        assert!(local_idx < MAX_LOCAL_TYPES);
                        let mut new_type = self.get_local_type(local_idx);
                        new_type.upgrade(opnd_type);
                        self.set_local_type(opts, local_idx, new_type);
                        // set_local_type() detaches all aliases of the local,
                        // including the one being upgraded. Re-attach it.
                        self.set_opnd_mapping(opts, opnd, TempMapping::MapToLocal(local_idx as u8));
                    }
                }
            }
        }
    }

    /// Set the tracked type of a local variable. Every stack slot aliasing
    /// the local detaches first, snapshotting the local's current type:
    /// the alias means "whatever the local holds", which is about to change,
    /// but the stack values themselves do not change.
    pub fn set_local_type(&mut self, opts: &Options, local_idx: usize, local_type: Type) {
        if opts.no_type_prop {
            return;
        }

        if local_idx >= MAX_LOCAL_TYPES {
            return;
        }

        for mapping_idx in 0..MAX_TEMP_TYPES {
            if let TempMapping::MapToLocal(idx) = self.temp_mapping[mapping_idx] {
                if idx as usize == local_idx {
                    self.temp_mapping[mapping_idx] =
                        TempMapping::MapToStack(self.get_local_type(local_idx));
                }
            }
        }

        self.local_types[local_idx] = local_type;
    }

    /// Erase all local variable type information, for operations whose
    /// effect on locals cannot be tracked. Aliases detach the same way as
    /// in [`Context::set_local_type`].
    pub fn clear_local_types(&mut self) {
        for mapping_idx in 0..MAX_TEMP_TYPES {
            if let TempMapping::MapToLocal(local_idx) = self.temp_mapping[mapping_idx] {
                self.temp_mapping[mapping_idx] =
                    TempMapping::MapToStack(self.get_local_type(local_idx.into()));
            }
        }

        self.local_types = [Type::Unknown; MAX_LOCAL_TYPES];
    }

    /// Compute a difference score between two contexts. `self` is the
    /// context we have, `dst` the context an existing block was compiled
    /// under. Finite scores mean `dst`'s code is safe to run here.
    pub fn diff(&self, dst: &Context) -> TypeDiff {
        let src = self;

        // Only the first version in a side chain is ever looked up
        if dst.chain_depth != 0 {
            return TypeDiff::Incompatible;
        }

        // Contexts mid-chain always get fresh versions; side chains at the
        // same location must not alias each other
        if src.chain_depth != 0 {
            return TypeDiff::Incompatible;
        }

        if dst.stack_size != src.stack_size {
            return TypeDiff::Incompatible;
        }

        if dst.sp_offset != src.sp_offset {
            return TypeDiff::Incompatible;
        }

        // Difference sum
        let mut diff = 0;

        diff += match src.self_type.diff(dst.self_type) {
            TypeDiff::Compatible(diff) => diff,
            TypeDiff::Incompatible => return TypeDiff::Incompatible,
        };

        // For each local type we track
        for i in 0..MAX_LOCAL_TYPES {
            let t_src = src.get_local_type(i);
            let t_dst = dst.get_local_type(i);
            diff += match t_src.diff(t_dst) {
                TypeDiff::Compatible(diff) => diff,
                TypeDiff::Incompatible => return TypeDiff::Incompatible,
            };
        }

        // For each value on the temp stack
        for i in 0..src.stack_size {
            let src_mapping = src.get_opnd_mapping(InsnOpnd::StackOpnd(i));
            let dst_mapping = dst.get_opnd_mapping(InsnOpnd::StackOpnd(i));

            if !src_mapping.same_kind(&dst_mapping) {
                if dst_mapping.without_type() == TempMapping::MapToStack(Type::Unknown) {
                    // Information about the source of the operand can be
                    // safely dropped
                    diff += 1;
                } else {
                    // dst claims an alias src does not have
                    return TypeDiff::Incompatible;
                }
            }

            let src_type = src.get_opnd_type(InsnOpnd::StackOpnd(i));
            let dst_type = dst.get_opnd_type(InsnOpnd::StackOpnd(i));

            diff += match src_type.diff(dst_type) {
                TypeDiff::Compatible(diff) => diff,
                TypeDiff::Incompatible => return TypeDiff::Incompatible,
            };
        }

        TypeDiff::Compatible(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InsnOpnd::*;

    fn opts() -> Options {
        Options::default()
    }

    #[test]
    fn test_type_diff_identity() {
        for ty in [
            Type::Unknown,
            Type::UnknownImm,
            Type::UnknownHeap,
            Type::Nil,
            Type::True,
            Type::False,
            Type::Fixnum,
            Type::Array,
            Type::Str,
        ] {
            assert_eq!(ty.diff(ty), TypeDiff::Compatible(0));
        }
    }

    #[test]
    fn test_type_diff_asymmetry() {
        // A known fixnum can run code compiled for unknown values,
        // but not the other way around
        assert_eq!(Type::Fixnum.diff(Type::Unknown), TypeDiff::Compatible(1));
        assert_eq!(Type::Unknown.diff(Type::Fixnum), TypeDiff::Incompatible);

        assert_eq!(Type::Fixnum.diff(Type::UnknownImm), TypeDiff::Compatible(1));
        assert_eq!(Type::Str.diff(Type::UnknownHeap), TypeDiff::Compatible(1));

        // Heap and immediate claims contradict
        assert_eq!(Type::Fixnum.diff(Type::UnknownHeap), TypeDiff::Incompatible);
        assert_eq!(Type::Str.diff(Type::UnknownImm), TypeDiff::Incompatible);
    }

    #[test]
    fn test_ctx_diff_requires_same_stack_shape() {
        let opts = opts();

        let mut a = Context::default();
        a.stack_push(&opts, Type::Fixnum);

        let b = Context::default();
        assert_eq!(a.diff(&b), TypeDiff::Incompatible);

        // Same stack size but different sp offset
        let mut c = a;
        c.sp_offset += 1;
        assert_eq!(a.diff(&c), TypeDiff::Incompatible);
    }

    #[test]
    fn test_ctx_diff_chained_contexts_never_match() {
        let mut a = Context::default();
        let b = Context::default();
        assert_eq!(a.diff(&b), TypeDiff::Compatible(0));

        a.chain_depth = 1;
        assert_eq!(a.diff(&b), TypeDiff::Incompatible);
        assert_eq!(b.diff(&a), TypeDiff::Incompatible);
    }

    #[test]
    fn test_ctx_diff_specific_query_matches_general_version() {
        let opts = opts();

        // Query has a fixnum on top, stored version knows nothing
        let mut query = Context::default();
        query.stack_push(&opts, Type::Fixnum);

        let mut stored = Context::default();
        stored.stack_push(&opts, Type::Unknown);

        assert_eq!(query.diff(&stored), TypeDiff::Compatible(1));
        // The reverse would let unknown values into specialized code
        assert_eq!(stored.diff(&query), TypeDiff::Incompatible);
    }

    #[test]
    fn test_ctx_diff_mapping_asymmetry() {
        let opts = opts();

        // Query top aliases a local, stored version treats it as plain stack
        let mut query = Context::default();
        query.stack_push_local(&opts, 0);

        let mut stored = Context::default();
        stored.stack_push(&opts, Type::Unknown);

        assert_eq!(query.diff(&stored), TypeDiff::Compatible(1));
        // Stored version claiming an alias the query lacks is unsound
        assert_eq!(stored.diff(&query), TypeDiff::Incompatible);
    }

    #[test]
    fn test_opnd_type_through_alias() {
        let opts = opts();

        let mut ctx = Context::default();
        ctx.set_local_type(&opts, 0, Type::Fixnum);
        ctx.stack_push_local(&opts, 0);

        assert_eq!(ctx.get_opnd_type(StackOpnd(0)), Type::Fixnum);

        ctx.stack_push_self(&opts);
        ctx.upgrade_opnd_type(&opts, StackOpnd(0), Type::Nil);
        // The upgrade propagated through to self
        assert_eq!(ctx.get_opnd_type(SelfOpnd), Type::Nil);
    }

    #[test]
    fn test_set_local_type_detaches_aliases() {
        let opts = opts();

        let mut ctx = Context::default();
        ctx.set_local_type(&opts, 0, Type::Fixnum);
        ctx.stack_push_local(&opts, 0);

        // Writing the local must not change what is already on the stack
        ctx.set_local_type(&opts, 0, Type::Str);
        assert_eq!(ctx.get_opnd_type(StackOpnd(0)), Type::Fixnum);
        assert_eq!(ctx.get_local_type(0), Type::Str);

        // The detached slot is now a plain stack value
        assert_eq!(
            ctx.get_opnd_mapping(StackOpnd(0)),
            TempMapping::MapToStack(Type::Fixnum)
        );
    }

    #[test]
    fn test_clear_local_types_detaches_aliases() {
        let opts = opts();

        let mut ctx = Context::default();
        ctx.set_local_type(&opts, 1, Type::True);
        ctx.stack_push_local(&opts, 1);
        ctx.clear_local_types();

        assert_eq!(ctx.get_local_type(1), Type::Unknown);
        assert_eq!(ctx.get_opnd_type(StackOpnd(0)), Type::True);
    }

    #[test]
    fn test_stack_pop_resets_slots() {
        let opts = opts();

        let mut ctx = Context::default();
        ctx.stack_push(&opts, Type::Fixnum);
        ctx.stack_pop(1);
        ctx.stack_push(&opts, Type::Unknown);

        // The reused slot does not inherit the old type
        assert_eq!(ctx.get_opnd_type(StackOpnd(0)), Type::Unknown);
        assert_eq!(ctx.stack_size, 1);
        assert_eq!(ctx.sp_offset, 1);
    }

    #[test]
    fn test_no_type_prop_records_nothing() {
        let opts = Options {
            no_type_prop: true,
            ..Options::default()
        };

        let mut ctx = Context::default();
        ctx.stack_push(&opts, Type::Fixnum);
        assert_eq!(ctx.get_opnd_type(StackOpnd(0)), Type::Unknown);

        ctx.upgrade_opnd_type(&opts, StackOpnd(0), Type::Fixnum);
        assert_eq!(ctx.get_opnd_type(StackOpnd(0)), Type::Unknown);

        ctx.set_local_type(&opts, 0, Type::Fixnum);
        assert_eq!(ctx.get_local_type(0), Type::Unknown);
    }

    #[test]
    fn test_generic_context_accepts_any_types() {
        let opts = opts();

        let mut query = Context::default();
        query.stack_push(&opts, Type::Str);
        query.stack_push(&opts, Type::Fixnum);
        query.self_type = Type::Nil;

        let stored = Context::generic(query.stack_size, query.sp_offset);
        assert!(matches!(query.diff(&stored), TypeDiff::Compatible(_)));
    }
}
