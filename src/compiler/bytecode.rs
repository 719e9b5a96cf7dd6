//! Bytecode definitions: the instruction set and the compiled program artifact.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::ast::Pos;
use crate::runtime::value::Value;

/// A single bytecode instruction.
///
/// The set is closed: the VM dispatches over it with one `match`. Jump
/// operands are offsets relative to the index of the jump instruction itself.
/// Variable accessors come in stack/stash/dynamic/global families; the
/// stack/stash forms are only ever produced by the allocation finalizer, which
/// rewrites [`Op::Unresolved`] placeholders once storage classes are known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Push `constants[n]`.
    Const(u32),
    /// Push `undefined`.
    Undefined,
    /// Push `null`.
    Null,
    /// Push `true`.
    True,
    /// Push `false`.
    False,
    /// Pop the top value.
    Pop,
    /// Duplicate the top value.
    Dup,
    /// Duplicate the top two values.
    Dup2,
    /// Swap the top two values.
    Swap,
    /// No operation. Left behind where an emitted scope instruction turned
    /// out to be unnecessary after finalization.
    Nop,

    /// Compile-time placeholder for a variable access; `n` indexes the
    /// compiler's access-point table. Never present in a frozen program.
    Unresolved(u32),

    /// Push the frame slot at the given offset (params negative, locals
    /// positive).
    LoadStack(i32),
    /// Like [`Op::LoadStack`] but faults if the slot is still uninitialized.
    LoadStackTdz(i32),
    /// Pop into the frame slot at the given offset.
    StoreStack(i32),
    /// Pop into the frame slot, clearing its uninitialized state. Emitted for
    /// declarations and hoisted `var` setup.
    InitStack(i32),
    /// Return the frame slot to its uninitialized state. Emitted at block
    /// entry for stack-allocated lexicals so loop re-entry restores the
    /// temporal dead zone.
    ResetStack(i32),

    /// Push `stash[idx]` after walking `level` stash-chain links.
    LoadStash { level: u16, idx: u16 },
    /// Like [`Op::LoadStash`] but faults if the slot is still uninitialized.
    LoadStashTdz { level: u16, idx: u16 },
    /// Pop into `stash[idx]` after walking `level` links.
    StoreStash { level: u16, idx: u16 },
    /// Pop into `stash[idx]`, clearing its uninitialized state.
    InitStash { level: u16, idx: u16 },

    /// Push the value of the named binding, resolving by name through the
    /// stash chain at runtime. Emitted when resolution crossed a dynamic
    /// (`with`) scope.
    LoadDynamic(u32),
    /// Like [`Op::LoadDynamic`] but pushes `undefined` when the name is
    /// missing, for `typeof`.
    LoadDynamicTypeof(u32),
    /// Pop and store through the dynamic chain.
    StoreDynamic(u32),
    /// Pop a value and throw a TypeError for assignment to the named
    /// constant.
    ThrowConst(u32),

    /// Push the named global; faults with a ReferenceError when absent.
    LoadGlobal(u32),
    /// Push the named global or `undefined` when absent, for `typeof`.
    LoadGlobalTypeof(u32),
    /// Pop into the named global, creating it when absent.
    StoreGlobal(u32),
    /// Pop into the named global; faults when absent (strict mode).
    StoreGlobalStrict(u32),
    /// Ensure the named global exists, defining it as `undefined` if not.
    DeclareGlobal(u32),
    /// Delete the named global, pushing whether it succeeded.
    DeleteGlobal(u32),

    /// Push a fresh stash from `stash_templates[n]` onto the chain.
    PushStash(u32),
    /// Pop an object and push a dynamic stash backed by it (`with`).
    PushWith,
    /// Pop the innermost stash off the chain.
    PopStash,

    /// Push `this`.
    This,
    /// Push `new.target` (or `undefined` outside construction).
    NewTarget,

    /// Push a new empty object.
    NewObject,
    /// Pop `n` values and push an array of them.
    NewArray(u16),
    /// Pop an object, push `object[constants[n]]`.
    GetProp(u32),
    /// Pop value then object, set `object[constants[n]]`, push the value.
    SetProp(u32),
    /// Pop key then object, push `object[key]`.
    GetElem,
    /// Pop value, key, object; set `object[key]`; push the value.
    SetElem,
    /// Pop an object, delete `constants[n]`, push whether it succeeded.
    DeleteProp(u32),
    /// Pop key then object, delete `object[key]`, push whether it succeeded.
    DeleteElem,

    /// Pop an object, push its private field at (level, idx) of the private
    /// environment chain.
    GetPrivate { level: u16, idx: u16 },
    /// Pop value then object, write the private field, push the value.
    SetPrivate { level: u16, idx: u16 },
    /// Pop value then object, define the private field on the object.
    InitPrivate { level: u16, idx: u16 },
    /// Name-keyed private access for code inside dynamic regions of a class
    /// body.
    GetPrivateDyn(u32),
    /// Name-keyed private write for dynamic regions.
    SetPrivateDyn(u32),
    /// Pop an object, push whether it carries the private field (brand
    /// check).
    PrivateIn { level: u16, idx: u16 },
    /// Push `private_envs[n]` onto the VM's private-environment chain.
    PushPrivateEnv(u32),
    /// Pop the innermost private environment.
    PopPrivateEnv,

    /// `+` with string concatenation and BigInt support.
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `**`
    Exp,
    /// Unary minus.
    Neg,
    /// Unary plus (ToNumber).
    ToNum,
    /// `!`
    Not,
    /// `~`
    BitNot,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `===`
    StrictEq,
    /// `!==`
    StrictNe,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `>>>`
    Ushr,
    /// `typeof`
    TypeOf,
    /// `instanceof`
    InstanceOf,
    /// `in`
    InOp,

    /// Unconditional relative jump.
    Jump(i32),
    /// Pop; jump when falsy.
    JumpIfFalse(i32),
    /// Pop; jump when truthy.
    JumpIfTrue(i32),
    /// Pop; jump when `null` or `undefined`.
    JumpIfNullish(i32),
    /// Pop; jump when neither `null` nor `undefined`.
    JumpIfNotNullish(i32),

    /// Call with `n` arguments. Stack: `[callee, this, arg0..argn-1]`.
    Call(u16),
    /// Construct with `n` arguments. Stack: `[callee, arg0..argn-1]`.
    New(u16),
    /// Instantiate `functions[n]` as a closure capturing the current stash
    /// chain, private-environment chain, and (for arrows) `this`.
    MakeClosure(u32),
    /// Pop the return value and leave the frame, running pending finallys
    /// and closing the frame's open iterators first.
    Return,

    /// Enter a protected region. Offsets are relative to this instruction;
    /// zero means the section is absent.
    Try { catch: i32, finally: i32 },
    /// Leave a protected region on the normal path and jump to the relative
    /// end offset, routing through the finally section if there is one.
    EndTry(i32),
    /// Finish a finally section and resume the pending completion.
    EndFinally,
    /// Pop a value and throw it.
    Throw,
    /// Unwinding branch for break/continue: discard `pendings` pending
    /// completions, unwind `tries` protected regions (running their
    /// finallys), then pop `stashes` stashes, close `iters` iterators, and
    /// jump to the relative target.
    Leave { tries: u16, pendings: u16, stashes: u16, iters: u16, target: i32 },

    /// Pop an object and push a key-enumeration iterator over it.
    IterIn,
    /// Pop a value and push an iterator over it (array, string, or an object
    /// with a callable `next`).
    IterOf,
    /// Advance the innermost iterator: push the next value, or jump to the
    /// relative target when exhausted.
    IterNext(i32),
    /// Pop the innermost iterator, giving it its close notification.
    IterClose,
}

/// Layout of one heap-resident variable frame, shared by every activation of
/// its scope.
#[derive(Debug, Clone, Default)]
pub struct StashTemplate {
    /// Name to slot index, used by dynamic lookups.
    pub names: FxHashMap<String, u16>,
    /// Number of slots.
    pub size: u16,
}

/// The private names declared by one class body, addressed by index.
#[derive(Debug, Clone, Default)]
pub struct PrivateTemplate {
    /// Name to field index.
    pub names: FxHashMap<String, u16>,
}

/// Where the VM places a value produced during frame entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef {
    /// A frame-relative stack slot.
    Stack(i32),
    /// A slot in the function's own stash.
    Stash(u16),
}

/// Behavioral flags of a compiled function.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramFlags {
    /// Arrow functions take `this` and `new.target` from their closure.
    pub arrow: bool,
    /// Strict code.
    pub strict: bool,
    /// The body references `arguments`, so frame entry materializes it.
    pub needs_arguments: bool,
    /// The function is a class constructor (only callable via `new`).
    pub ctor: bool,
    /// The function is a method or arrow (never callable via `new`).
    pub no_construct: bool,
}

/// A compiled function: the immutable compilation artifact.
///
/// Programs are frozen once the compiler finishes and are shared by every
/// closure created from the same function literal; they may also be executed
/// concurrently by independent VM instances.
#[derive(Debug, Clone)]
pub struct Program {
    /// Function name, or `"<main>"` for a top-level script.
    pub name: String,
    /// Script name, shared across all programs of one compilation.
    pub file: Arc<str>,
    /// The instructions.
    pub code: Box<[Op]>,
    /// The constant pool.
    pub constants: Box<[Value]>,
    /// Nested function literals, referenced by [`Op::MakeClosure`].
    pub functions: Box<[Arc<Program>]>,
    /// Block stash layouts, referenced by [`Op::PushStash`].
    pub stash_templates: Box<[Arc<StashTemplate>]>,
    /// Layout of the function-scope stash created at frame entry, if any
    /// binding of the function scope is captured or dynamically reachable.
    pub func_stash: Option<u32>,
    /// Private-name tables, referenced by [`Op::PushPrivateEnv`].
    pub private_envs: Box<[Arc<PrivateTemplate>]>,
    /// Sorted `(pc, source offset)` pairs; each entry applies until the next.
    pub src_map: Box<[(u32, Pos)]>,
    /// Declared parameter count.
    pub num_args: u16,
    /// Number of positive frame slots to allocate at entry.
    pub num_locals: u16,
    /// Arguments copied into the function stash at entry, as
    /// `(parameter index, stash slot)` pairs, for captured parameters.
    pub param_copies: Box<[(u16, u16)]>,
    /// Where the `arguments` object goes when `needs_arguments` is set.
    pub arguments_at: Option<SlotRef>,
    /// Where a named function expression's self-reference binding goes.
    pub callee_at: Option<SlotRef>,
    /// Behavioral flags.
    pub flags: ProgramFlags,
}

impl Program {
    /// The source offset active at the given instruction index.
    pub fn pos_at(&self, pc: usize) -> Pos {
        match self.src_map.binary_search_by_key(&(pc as u32), |&(p, _)| p) {
            Ok(i) => self.src_map[i].1,
            Err(0) => 0,
            Err(i) => self.src_map[i - 1].1,
        }
    }
}

impl fmt::Display for Program {
    /// A compact disassembly listing, one instruction per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; {} ({} ops, {} consts)", self.name, self.code.len(), self.constants.len())?;
        for (i, op) in self.code.iter().enumerate() {
            writeln!(f, "{i:5}  {op:?}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_program() -> Program {
        Program {
            name: "<main>".to_string(),
            file: Arc::from("test"),
            code: vec![Op::Undefined, Op::Return].into_boxed_slice(),
            constants: Box::default(),
            functions: Box::default(),
            stash_templates: Box::default(),
            func_stash: None,
            private_envs: Box::default(),
            src_map: vec![(0, 0), (1, 7)].into_boxed_slice(),
            num_args: 0,
            num_locals: 0,
            param_copies: Box::default(),
            arguments_at: None,
            callee_at: None,
            flags: ProgramFlags::default(),
        }
    }

    #[test]
    fn test_pos_at_lookup() {
        let program = empty_program();
        assert_eq!(program.pos_at(0), 0);
        assert_eq!(program.pos_at(1), 7);
        // Past the last entry the final position still applies.
        assert_eq!(program.pos_at(5), 7);
    }

    #[test]
    fn test_display_lists_instructions() {
        let program = empty_program();
        let listing = format!("{}", program);
        assert!(listing.contains("<main>"));
        assert!(listing.contains("Return"));
    }
}
