use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::debug;

use crate::analysis;
use crate::ast::{Ast, ExprId, ExprKind};
use crate::error::{OpalError, OpalResult};
use crate::heap::Heap;
use crate::intrinsics;
use crate::lexer;
use crate::location::SourceLocation;
use crate::parser;
use crate::printer;
use crate::symbol::SymbolTable;
use crate::value::{self, Closure, Env, Location, OpalValue, SymbolId};

/// How far past the literal prefix the heap may grow before the first
/// collection. Afterwards the threshold tracks twice the live size.
const GC_HEADROOM: usize = 64;

/// One entry on the evaluation stack: where we are in one expression.
///
/// A layer whose `frame` flag is set marks a call boundary and owns its
/// environment; the layers above it share that environment through the
/// same `Rc`. Tail calls unwind to the nearest frame.
struct Layer {
    env: Rc<RefCell<Env>>,
    /// `None` only for the base frame, where evaluation terminates.
    expr: Option<ExprId>,
    frame: bool,
    /// Progress within this expression; meaning depends on the node kind.
    pc: usize,
    /// Locations of already-evaluated children (callee and arguments).
    /// These are GC roots for every layer, frame or not.
    local: Vec<Location>,
}

impl Layer {
    fn new(env: Rc<RefCell<Env>>, expr: Option<ExprId>, frame: bool) -> Self {
        Layer {
            env,
            expr,
            frame,
            pc: 0,
            local: Vec::new(),
        }
    }
}

/// The interpreter state machine. All interpreter state lives here: the
/// analyzed program, the value heap, the layer stack, and the result
/// cursor that carries each finished subexpression's location upward.
pub struct Machine {
    ast: Ast,
    symbols: SymbolTable,
    heap: Heap,
    stack: Vec<Layer>,
    result: Location,
}

impl Machine {
    /// Lex, parse, analyze, and preallocate `source`, ready to execute.
    pub fn new(source: &[u8]) -> OpalResult<Machine> {
        let tokens = lexer::lex(source)?;
        let mut symbols = SymbolTable::new();
        let (mut ast, root) = parser::parse(tokens, &mut symbols)?;
        analysis::analyze(&mut ast, root)?;
        let mut heap = Heap::new();
        analysis::preallocate(&mut ast, &mut heap)?;
        heap.freeze_literals();
        debug!(
            "machine ready: {} nodes, {} literals, {} names",
            ast.len(),
            heap.num_literals(),
            symbols.count()
        );
        // the base frame, which TCO can never remove, and below it the
        // root expression sharing the base environment
        let base_env = Rc::new(RefCell::new(Env::new()));
        let stack = vec![
            Layer::new(base_env.clone(), None, true),
            Layer::new(base_env, Some(root), false),
        ];
        Ok(Machine {
            ast,
            symbols,
            heap,
            stack,
            result: 0,
        })
    }

    /// Run to completion, collecting garbage whenever the heap outgrows a
    /// live-set-proportional threshold.
    pub fn execute(&mut self) -> OpalResult<()> {
        let mut gc_threshold = self.heap.num_literals() + GC_HEADROOM;
        while self.step()? {
            let total = self.heap.len();
            if total > gc_threshold {
                let removed = self.collect();
                let live = total - removed;
                gc_threshold = live * 2;
            }
        }
        Ok(())
    }

    /// The final value. Only meaningful after `execute` returns Ok.
    pub fn result_value(&self) -> &OpalValue {
        self.heap.get(self.result)
    }

    /// The final value in its printed form.
    pub fn render_result(&self) -> Vec<u8> {
        printer::render(self.result_value(), &self.ast)
    }

    // ========================================================================
    // The stepper
    // ========================================================================

    /// Advance by exactly one transition: push a child layer, finish a
    /// terminal computation, or pop a completed layer. Returns Ok(false)
    /// once only the base frame remains.
    pub fn step(&mut self) -> OpalResult<bool> {
        let top = self.stack.len() - 1;
        let Some(expr_id) = self.stack[top].expr else {
            // base frame: end of evaluation
            return Ok(false);
        };
        let sl = self.ast.node(expr_id).sl;
        match &self.ast.node(expr_id).kind {
            ExprKind::Integer { loc, .. } | ExprKind::String { loc, .. } => match loc {
                Some(loc) => {
                    self.result = *loc;
                    self.stack.pop();
                }
                None => return Err(self.runtime_error("literal without a preallocated cell", sl)),
            },

            ExprKind::Variable { name } => {
                let name = *name;
                let found = value::lookup(name, &self.stack[top].env.borrow());
                match found {
                    Some(loc) => {
                        self.result = loc;
                        self.stack.pop();
                    }
                    None => return Err(self.undefined_variable(name, sl)),
                }
            }

            ExprKind::Lambda { .. } => {
                // retain exactly the bindings for the body's free variables,
                // each matched once, preserving their original order
                let mut wanted = self.ast.node(expr_id).free_vars.clone();
                let mut captured = Env::new();
                for &(name, loc) in self.stack[top].env.borrow().iter().rev() {
                    if wanted.is_empty() {
                        break;
                    }
                    if wanted.remove(&name) {
                        captured.push((name, loc));
                    }
                }
                captured.reverse();
                self.result = self.heap.alloc(OpalValue::Closure(Closure {
                    env: captured,
                    lambda: expr_id,
                }));
                self.stack.pop();
            }

            ExprKind::Letrec { bindings, body } => {
                let body = *body;
                let k = bindings.len();
                let pc = self.stack[top].pc;
                // an initializer just finished: overwrite its binder's cell
                if pc >= 2 && pc <= k + 1 {
                    let name = bindings[pc - 2].0;
                    match value::lookup(name, &self.stack[top].env.borrow()) {
                        Some(loc) => {
                            let value = self.heap.get(self.result).clone();
                            self.heap.set(loc, value);
                        }
                        None => return Err(self.undefined_variable(name, sl)),
                    }
                }
                if pc == 0 {
                    // introduce every binder as Void before any initializer
                    self.stack[top].pc = 1;
                    for &(name, _) in bindings {
                        let loc = self.heap.alloc(OpalValue::Void);
                        self.stack[top].env.borrow_mut().push((name, loc));
                    }
                } else if pc <= k {
                    self.stack[top].pc = pc + 1;
                    let init = bindings[pc - 1].1;
                    let env = self.stack[top].env.clone();
                    self.stack.push(Layer::new(env, Some(init), false));
                } else if pc == k + 1 {
                    self.stack[top].pc = pc + 1;
                    let env = self.stack[top].env.clone();
                    self.stack.push(Layer::new(env, Some(body), false));
                } else {
                    // the binders go out of scope; the cursor already holds
                    // the body's value
                    let mut env = self.stack[top].env.borrow_mut();
                    for _ in 0..k {
                        env.pop();
                    }
                    drop(env);
                    self.stack.pop();
                }
            }

            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let pc = self.stack[top].pc;
                if pc == 0 {
                    self.stack[top].pc = 1;
                    let (cond, env) = (*cond, self.stack[top].env.clone());
                    self.stack.push(Layer::new(env, Some(cond), false));
                } else if pc == 1 {
                    self.stack[top].pc = 2;
                    let taken = match self.heap.get(self.result) {
                        OpalValue::Integer(v) => *v != 0,
                        _ => return Err(self.runtime_error("wrong cond type", sl)),
                    };
                    let branch = if taken { *then_branch } else { *else_branch };
                    let env = self.stack[top].env.clone();
                    self.stack.push(Layer::new(env, Some(branch), false));
                } else {
                    self.stack.pop();
                }
            }

            ExprKind::Sequence { exprs } => {
                let pc = self.stack[top].pc;
                if pc < exprs.len() {
                    self.stack[top].pc = pc + 1;
                    let (next, env) = (exprs[pc], self.stack[top].env.clone());
                    self.stack.push(Layer::new(env, Some(next), false));
                } else {
                    // the sequence's value is its last expression's value
                    self.stack.pop();
                }
            }

            ExprKind::IntrinsicCall { name, args } => {
                let pc = self.stack[top].pc;
                if pc > 0 && pc <= args.len() {
                    let loc = self.result;
                    self.stack[top].local.push(loc);
                }
                if pc < args.len() {
                    self.stack[top].pc = pc + 1;
                    let (arg, env) = (args[pc], self.stack[top].env.clone());
                    self.stack.push(Layer::new(env, Some(arg), false));
                } else {
                    let value = intrinsics::dispatch(name, sl, &self.stack[top].local, &self.heap)
                        .map_err(|e| e.with_trace(self.frame_trace()))?;
                    self.result = self.heap.alloc(value);
                    self.stack.pop();
                }
            }

            ExprKind::ExprCall { callee, args } => {
                let k = args.len();
                let pc = self.stack[top].pc;
                if pc > 2 && pc <= k + 2 {
                    let loc = self.result;
                    self.stack[top].local.push(loc);
                }
                if pc == 0 {
                    self.stack[top].pc = 1;
                    let (callee, env) = (*callee, self.stack[top].env.clone());
                    self.stack.push(Layer::new(env, Some(callee), false));
                } else if pc == 1 {
                    // root the callee in this layer's locals so argument
                    // evaluation cannot collect it
                    self.stack[top].pc = 2;
                    let loc = self.result;
                    self.stack[top].local.push(loc);
                } else if pc <= k + 1 {
                    self.stack[top].pc = pc + 1;
                    let (arg, env) = (args[pc - 2], self.stack[top].env.clone());
                    self.stack.push(Layer::new(env, Some(arg), false));
                } else if pc == k + 2 {
                    self.stack[top].pc = pc + 1;
                    let callee_loc = self.stack[top].local[0];
                    let closure = match self.heap.get(callee_loc) {
                        OpalValue::Closure(c) => c.clone(),
                        _ => return Err(self.runtime_error("calling a non-callable", sl)),
                    };
                    let (params, body) = match &self.ast.node(closure.lambda).kind {
                        ExprKind::Lambda { params, body } => (params, *body),
                        _ => return Err(self.runtime_error("closure lost its lambda node", sl)),
                    };
                    if self.stack[top].local.len() - 1 != params.len() {
                        return Err(self.runtime_error("wrong number of arguments", sl));
                    }
                    // lexical scope: the callee's environment is the
                    // closure's captured one plus the argument bindings
                    let mut new_env = closure.env;
                    for (i, &param) in params.iter().enumerate() {
                        new_env.push((param, self.stack[top].local[i + 1]));
                    }
                    if self.ast.node(expr_id).tail {
                        // unwind to and including the nearest frame before
                        // entering the callee
                        while let Some(layer) = self.stack.last() {
                            let frame = layer.frame;
                            self.stack.pop();
                            if frame {
                                break;
                            }
                        }
                    }
                    self.stack.push(Layer::new(
                        Rc::new(RefCell::new(new_env)),
                        Some(body),
                        true,
                    ));
                } else {
                    self.stack.pop();
                }
            }

            ExprKind::At { var, expr } => {
                let pc = self.stack[top].pc;
                if pc == 0 {
                    self.stack[top].pc = 1;
                    let (expr, env) = (*expr, self.stack[top].env.clone());
                    self.stack.push(Layer::new(env, Some(expr), false));
                } else {
                    let var = *var;
                    let closure = match self.heap.get(self.result) {
                        OpalValue::Closure(c) => c,
                        _ => return Err(self.runtime_error("@ wrong type", sl)),
                    };
                    match value::lookup(var, &closure.env) {
                        Some(loc) => {
                            self.result = loc;
                            self.stack.pop();
                        }
                        None => return Err(self.undefined_variable(var, sl)),
                    }
                }
            }
        }
        Ok(true)
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    /// Mark from all roots, compact the heap, and rewrite every live
    /// location. Returns the number of cells removed.
    fn collect(&mut self) -> usize {
        let mut marked: HashSet<Location> = HashSet::new();
        for layer in &self.stack {
            // frames own environments; inner layers share the frame's, so
            // marking frames covers every environment exactly once
            if layer.frame {
                for &(_, loc) in layer.env.borrow().iter() {
                    self.heap.mark_from(loc, &mut marked);
                }
            }
            for &loc in &layer.local {
                self.heap.mark_from(loc, &mut marked);
            }
        }
        self.heap.mark_from(self.result, &mut marked);

        let (removed, relocation) = self.heap.sweep_compact(&marked);
        if !relocation.is_empty() {
            self.relocate(&relocation);
        }
        debug!(
            "gc: removed {} cells, {} live ({} literals)",
            removed,
            self.heap.len(),
            self.heap.num_literals()
        );
        removed
    }

    /// Rewrite every held location through the relocation map: frame
    /// environments, all layers' locals, the result cursor, and captured
    /// environments inside heap closures.
    fn relocate(&mut self, relocation: &HashMap<Location, Location>) {
        for layer in &mut self.stack {
            if layer.frame {
                for (_, loc) in layer.env.borrow_mut().iter_mut() {
                    if let Some(&new) = relocation.get(loc) {
                        *loc = new;
                    }
                }
            }
            for loc in &mut layer.local {
                if let Some(&new) = relocation.get(loc) {
                    *loc = new;
                }
            }
        }
        if let Some(&new) = relocation.get(&self.result) {
            self.result = new;
        }
        self.heap.relocate_closures(relocation);
    }

    // ========================================================================
    // Error plumbing
    // ========================================================================

    /// Body locations of the live call frames, newest first. The base
    /// frame reports the start of the program.
    fn frame_trace(&self) -> Vec<SourceLocation> {
        self.stack
            .iter()
            .rev()
            .filter(|layer| layer.frame)
            .map(|layer| match layer.expr {
                Some(id) => self.ast.node(id).sl,
                None => SourceLocation::start(),
            })
            .collect()
    }

    fn runtime_error(&self, message: &str, sl: SourceLocation) -> OpalError {
        OpalError::runtime(sl, message).with_trace(self.frame_trace())
    }

    fn undefined_variable(&self, name: SymbolId, sl: SourceLocation) -> OpalError {
        self.runtime_error(&format!("undefined variable {}", self.symbols.name(name)), sl)
    }
}
