//! Scope and binding records for variable resolution during compilation.
//!
//! Scopes and bindings form a tree with back-references in both directions,
//! so they live in an index-addressed arena: a [`ScopeId`] or [`BindingId`]
//! is a plain integer into the [`ScopeArena`], never an owning pointer.
//! Everything here exists only while the compiler runs; the allocation
//! finalizer consumes these records to rewrite placeholder instructions and
//! then the arena is dropped.

use rustc_hash::FxHashMap;

use crate::ast::Pos;
use crate::compiler::CompileError;

/// Index of a scope in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// Index of a binding in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(pub u32);

/// Index of a program under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgId(pub u32);

/// What kind of declaration produced a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// `var` declaration, hoisted to the nearest variable-target scope.
    Var,
    /// `let` declaration, block-scoped, TDZ-checked.
    Let,
    /// `const` declaration, block-scoped, TDZ-checked, immutable.
    Const,
    /// A function parameter.
    Arg,
    /// A hoisted function declaration.
    Function,
}

impl BindingKind {
    /// Whether reads must fault until the declaration has executed.
    pub fn has_tdz(self) -> bool {
        matches!(self, BindingKind::Let | BindingKind::Const)
    }

    /// Whether duplicate declaration in the same scope is an error.
    pub fn is_lexical(self) -> bool {
        matches!(self, BindingKind::Let | BindingKind::Const)
    }
}

/// How an access point touches a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read the value.
    Load,
    /// Read for `typeof` (identical to Load for declared bindings).
    LoadTypeof,
    /// Overwrite the value.
    Store,
    /// First write from the declaration itself; clears the TDZ state.
    Init,
    /// Return the slot to its uninitialized state at block entry, restoring
    /// the temporal dead zone on loop re-entry.
    Reset,
}

/// One instruction-stream location where a binding is touched. The
/// instruction at `pc` is a placeholder until the binding's scope finalizes.
#[derive(Debug, Clone, Copy)]
pub struct AccessPoint {
    /// The program the placeholder was emitted into.
    pub prog: ProgId,
    /// The placeholder's instruction index.
    pub pc: u32,
    /// The scope the access occurs in, for stash-level computation.
    pub origin: ScopeId,
    /// What the access does.
    pub mode: AccessMode,
}

/// The storage class of a binding, decided once by the allocation finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// A transient frame slot: parameters negative, locals positive.
    Stack(i32),
    /// A slot in the owning scope's stash.
    Stash(u16),
    /// A property of the global environment (top-level `var`/function).
    Global,
}

/// A declared name.
#[derive(Debug)]
pub struct Binding {
    /// The declared name.
    pub name: String,
    /// The owning scope.
    pub scope: ScopeId,
    /// The declaration kind.
    pub kind: BindingKind,
    /// For `Arg` bindings, the parameter index.
    pub arg_index: u16,
    /// Every recorded access point, in emission order.
    pub accesses: Vec<AccessPoint>,
    /// Set when the binding is reachable from outside its call frame,
    /// either from a nested function or through a dynamic (`with`) region.
    /// Forces stash storage.
    pub captured: bool,
    /// The resolved storage, present only after finalization.
    pub storage: Option<Storage>,
}

/// What a scope is, structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// The top-level script scope. Function boundary and variable target;
    /// its `var` and function bindings live on the global environment.
    Global,
    /// A function body. Function boundary and variable target.
    Function,
    /// An ordinary block.
    Block,
    /// The body of a `with` statement: fully dynamic, declares nothing
    /// itself, and forces name-keyed lookups on anything resolved through
    /// it.
    With,
}

/// A lexical scope under compilation.
#[derive(Debug)]
pub struct Scope {
    /// The enclosing scope.
    pub outer: Option<ScopeId>,
    /// Child scopes, in creation order.
    pub children: Vec<ScopeId>,
    /// Bindings declared here, in declaration order.
    pub bindings: Vec<BindingId>,
    /// Name lookup for `bindings`.
    pub names: FxHashMap<String, BindingId>,
    /// Structural kind.
    pub kind: ScopeKind,
    /// Strict code.
    pub strict: bool,
    /// For function-boundary scopes, whether the function is an arrow.
    pub arrow: bool,
    /// Number of function boundaries between this scope and the root.
    pub func_depth: u32,
    /// The program this scope emits into.
    pub prog: ProgId,
    /// Set by the finalizer when the scope allocates a stash; the value is
    /// the number of stash slots.
    pub stash_size: Option<u16>,
    /// Whether the finalizer has run for this scope.
    pub finalized: bool,
}

impl Scope {
    /// Whether `var` declarations hoist into this scope.
    pub fn is_variable_target(&self) -> bool {
        matches!(self.kind, ScopeKind::Global | ScopeKind::Function)
    }

    /// Whether this scope starts a new call frame.
    pub fn is_function_boundary(&self) -> bool {
        matches!(self.kind, ScopeKind::Global | ScopeKind::Function)
    }

    /// Whether the scope pushes a runtime stash frame, either a slotted one
    /// (finalizer allocated slots) or a `with` object scope.
    pub fn has_runtime_stash(&self) -> bool {
        self.kind == ScopeKind::With || self.stash_size.is_some()
    }
}

/// The result of resolving a name from some scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Found, and no dynamic scope was crossed: a static accessor
    /// instruction can be used.
    Static(BindingId),
    /// A dynamic scope was crossed on the way; a name-keyed runtime lookup
    /// must be emitted. The binding that would be found statically, if any,
    /// is forced onto the stash so the runtime walk can reach it.
    Dynamic(Option<BindingId>),
    /// Not declared anywhere: a global reference.
    Unresolved,
}

/// The arena holding all scopes and bindings of one compilation.
#[derive(Debug, Default)]
pub struct ScopeArena {
    scopes: Vec<Scope>,
    bindings: Vec<Binding>,
}

impl ScopeArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a scope and returns its id.
    pub fn push_scope(
        &mut self,
        outer: Option<ScopeId>,
        kind: ScopeKind,
        prog: ProgId,
    ) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        let (strict, func_depth) = match outer {
            Some(o) => {
                let outer_scope = &self.scopes[o.0 as usize];
                let depth = if kind == ScopeKind::Function {
                    outer_scope.func_depth + 1
                } else {
                    outer_scope.func_depth
                };
                (outer_scope.strict, depth)
            }
            None => (false, 0),
        };
        self.scopes.push(Scope {
            outer,
            children: Vec::new(),
            bindings: Vec::new(),
            names: FxHashMap::default(),
            kind,
            strict,
            arrow: false,
            func_depth,
            prog,
            stash_size: None,
            finalized: false,
        });
        if let Some(o) = outer {
            self.scopes[o.0 as usize].children.push(id);
        }
        id
    }

    /// Shared access to a scope.
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    /// Mutable access to a scope.
    pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    /// Shared access to a binding.
    pub fn binding(&self, id: BindingId) -> &Binding {
        &self.bindings[id.0 as usize]
    }

    /// Mutable access to a binding.
    pub fn binding_mut(&mut self, id: BindingId) -> &mut Binding {
        &mut self.bindings[id.0 as usize]
    }

    /// Declares a name in `scope`. Duplicate lexical declarations (or a
    /// lexical colliding with anything else) in the same scope are
    /// compile-time errors.
    pub fn declare(
        &mut self,
        scope: ScopeId,
        name: &str,
        kind: BindingKind,
        pos: Pos,
    ) -> Result<BindingId, CompileError> {
        if let Some(&existing) = self.scope(scope).names.get(name) {
            let existing_kind = self.binding(existing).kind;
            if kind.is_lexical() || existing_kind.is_lexical() {
                return Err(CompileError::syntax(
                    format!("identifier '{name}' has already been declared"),
                    pos,
                ));
            }
            // var-on-var and function-on-var redeclaration collapse onto the
            // existing binding.
            return Ok(existing);
        }
        let id = BindingId(self.bindings.len() as u32);
        self.bindings.push(Binding {
            name: name.to_string(),
            scope,
            kind,
            arg_index: 0,
            accesses: Vec::new(),
            captured: false,
            storage: None,
        });
        let s = self.scope_mut(scope);
        s.bindings.push(id);
        s.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Resolves `name` from `from`, walking outward through enclosing
    /// scopes and noting any dynamic scope crossed on the way.
    pub fn resolve(&self, from: ScopeId, name: &str) -> Resolution {
        let mut crossed_dynamic = false;
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let scope = self.scope(id);
            if let Some(&binding) = scope.names.get(name) {
                return if crossed_dynamic {
                    Resolution::Dynamic(Some(binding))
                } else {
                    Resolution::Static(binding)
                };
            }
            if scope.kind == ScopeKind::With {
                crossed_dynamic = true;
            }
            cursor = scope.outer;
        }
        if crossed_dynamic {
            Resolution::Dynamic(None)
        } else {
            Resolution::Unresolved
        }
    }

    /// The nearest function-boundary scope at or above `from`.
    pub fn function_scope(&self, from: ScopeId) -> ScopeId {
        let mut cursor = from;
        loop {
            let scope = self.scope(cursor);
            if scope.is_function_boundary() {
                return cursor;
            }
            cursor = scope.outer.expect("scope chain always ends at a function boundary");
        }
    }

    /// The nearest non-arrow function-boundary scope at or above `from`,
    /// used when lazily materializing `arguments`.
    pub fn home_function_scope(&self, from: ScopeId) -> ScopeId {
        let mut cursor = from;
        loop {
            let scope = self.scope(cursor);
            if scope.is_function_boundary() && !scope.arrow {
                return cursor;
            }
            cursor = scope.outer.expect("scope chain always ends at the global scope");
        }
    }

    /// The nearest variable-target scope for `var` hoisting.
    pub fn variable_scope(&self, from: ScopeId) -> ScopeId {
        let mut cursor = from;
        loop {
            let scope = self.scope(cursor);
            if scope.is_variable_target() {
                return cursor;
            }
            cursor = scope.outer.expect("scope chain always ends at the global scope");
        }
    }

    /// Counts stash-chain links between an access in `origin` and the stash
    /// of `target`. Requires every scope on the path to have been finalized,
    /// which holds because inner scopes always finalize before outer ones.
    pub fn stash_level(&self, origin: ScopeId, target: ScopeId) -> u16 {
        let mut level: u16 = 0;
        let mut cursor = origin;
        loop {
            let scope = self.scope(cursor);
            if scope.has_runtime_stash() {
                if cursor == target {
                    return level;
                }
                level += 1;
            } else {
                debug_assert!(cursor != target, "level target must own a stash");
            }
            cursor = self
                .scope(cursor)
                .outer
                .expect("stash level walk ran past the root scope");
        }
    }

    /// Counts runtime stash frames pushed by scopes strictly inside
    /// `boundary`, walking up from `from` (inclusive). Used to patch the
    /// stash-pop counts of unwinding branches.
    pub fn stashes_between(&self, from: ScopeId, boundary: ScopeId) -> u16 {
        let mut count: u16 = 0;
        let mut cursor = from;
        while cursor != boundary {
            let scope = self.scope(cursor);
            if scope.has_runtime_stash() {
                count += 1;
            }
            cursor = scope
                .outer
                .expect("unwind boundary must enclose the jump origin");
        }
        count
    }
}

/// Compile-time tracker for one breakable/continuable construct.
#[derive(Debug)]
pub struct Block {
    /// What the construct is.
    pub kind: BlockKind,
    /// Label attached via a labeled statement, if any.
    pub label: Option<String>,
    /// Unresolved break branches out of this block.
    pub breaks: Vec<JumpOut>,
    /// Unresolved continue branches to this block's continue point.
    pub continues: Vec<JumpOut>,
    /// The scope enclosing the construct: stash pops for jumps out of the
    /// block are counted up to (exclusive) this scope.
    pub scope: ScopeId,
    /// The construct holds an open iterator (for-in / for-of).
    pub has_iter: bool,
}

/// The kinds of construct a [`Block`] can track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// A loop: breakable and continuable.
    Loop,
    /// A switch: breakable only.
    Switch,
    /// An active protected region; jumps crossing it unwind its runtime
    /// record.
    Try,
    /// A finally section being compiled; its runtime record is already
    /// popped, but jumps out must discard its pending completion.
    Finally,
    /// A labeled plain statement: breakable only.
    Label,
}

/// One emitted-but-unpatched branch out of a block.
#[derive(Debug, Clone, Copy)]
pub struct JumpOut {
    /// Instruction index of the `Leave` placeholder.
    pub pc: u32,
    /// Scope from which stash pops are counted once targets are known. For
    /// jumps that unwind protected regions this is the scope of the
    /// outermost region crossed, because unwinding already restores the
    /// stash chain to that region's entry state.
    pub effective_scope: ScopeId,
}
