use std::collections::HashSet;

use crate::ast::{Ast, ExprId, ExprKind};
use crate::error::{OpalError, OpalResult};
use crate::heap::Heap;
use crate::quoting;
use crate::value::{OpalValue, SymbolId};

/// Run the static passes: duplicate-binder rejection, free-variable sets,
/// tail flags. The root expression itself is never in tail position.
pub fn analyze(ast: &mut Ast, root: ExprId) -> OpalResult<()> {
    check_duplicates(ast)?;
    compute_free_vars(ast, root);
    compute_tail(ast, root, false);
    Ok(())
}

/// No name may appear twice in a lambda's parameter list or a letrec's
/// binder list.
fn check_duplicates(ast: &Ast) -> OpalResult<()> {
    for id in ast.ids() {
        let node = ast.node(id);
        match &node.kind {
            ExprKind::Lambda { params, .. } => {
                let mut seen = HashSet::new();
                for &name in params {
                    if !seen.insert(name) {
                        return Err(OpalError::sema(node.sl, "duplicate parameter names"));
                    }
                }
            }
            ExprKind::Letrec { bindings, .. } => {
                let mut seen = HashSet::new();
                for &(name, _) in bindings {
                    if !seen.insert(name) {
                        return Err(OpalError::sema(node.sl, "duplicate binding names"));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Bottom-up free-variable sets: the union of the children's sets, minus
/// the names bound at this node. A variable contributes its own name; the
/// variable inspected by `at` is not free (it is resolved in the closure's
/// captured environment, not the current one).
fn compute_free_vars(ast: &mut Ast, id: ExprId) -> HashSet<SymbolId> {
    let (children, bound): (Vec<ExprId>, Vec<SymbolId>) = match &ast.node(id).kind {
        ExprKind::Integer { .. } | ExprKind::String { .. } | ExprKind::Variable { .. } => {
            (Vec::new(), Vec::new())
        }
        ExprKind::Lambda { params, body } => (vec![*body], params.clone()),
        ExprKind::Letrec { bindings, body } => {
            let mut children: Vec<ExprId> = bindings.iter().map(|&(_, init)| init).collect();
            children.push(*body);
            (children, bindings.iter().map(|&(name, _)| name).collect())
        }
        ExprKind::If {
            cond,
            then_branch,
            else_branch,
        } => (vec![*cond, *then_branch, *else_branch], Vec::new()),
        ExprKind::Sequence { exprs } => (exprs.clone(), Vec::new()),
        ExprKind::IntrinsicCall { args, .. } => (args.clone(), Vec::new()),
        ExprKind::ExprCall { callee, args } => {
            let mut children = vec![*callee];
            children.extend_from_slice(args);
            (children, Vec::new())
        }
        ExprKind::At { expr, .. } => (vec![*expr], Vec::new()),
    };

    let mut free = HashSet::new();
    for child in children {
        free.extend(compute_free_vars(ast, child));
    }
    for name in bound {
        free.remove(&name);
    }
    if let ExprKind::Variable { name } = &ast.node(id).kind {
        free.insert(*name);
    }
    ast.node_mut(id).free_vars = free.clone();
    free
}

/// Top-down tail flags. A lambda body is the body of a call frame, so it is
/// always tail; if-branches, a sequence's last element, and a letrec body
/// inherit this node's flag; every other child position is non-tail.
fn compute_tail(ast: &mut Ast, id: ExprId, parent_tail: bool) {
    ast.node_mut(id).tail = parent_tail;
    let tail_children: Vec<(ExprId, bool)> = match &ast.node(id).kind {
        ExprKind::Integer { .. } | ExprKind::String { .. } | ExprKind::Variable { .. } => Vec::new(),
        ExprKind::Lambda { body, .. } => vec![(*body, true)],
        ExprKind::Letrec { bindings, body } => {
            let mut children: Vec<(ExprId, bool)> =
                bindings.iter().map(|&(_, init)| (init, false)).collect();
            children.push((*body, parent_tail));
            children
        }
        ExprKind::If {
            cond,
            then_branch,
            else_branch,
        } => vec![
            (*cond, false),
            (*then_branch, parent_tail),
            (*else_branch, parent_tail),
        ],
        ExprKind::Sequence { exprs } => {
            let last = exprs.len() - 1;
            exprs
                .iter()
                .enumerate()
                .map(|(i, &e)| (e, i == last && parent_tail))
                .collect()
        }
        ExprKind::IntrinsicCall { args, .. } => args.iter().map(|&a| (a, false)).collect(),
        ExprKind::ExprCall { callee, args } => {
            let mut children = vec![(*callee, false)];
            children.extend(args.iter().map(|&a| (a, false)));
            children
        }
        ExprKind::At { expr, .. } => vec![(*expr, false)],
    };
    for (child, tail) in tail_children {
        compute_tail(ast, child, tail);
    }
}

/// Evaluate every integer and string literal into a fresh heap cell and
/// record the cell on the node. The caller freezes the literal prefix once
/// this returns.
pub fn preallocate(ast: &mut Ast, heap: &mut Heap) -> OpalResult<()> {
    for id in ast.ids() {
        let value = match &ast.node(id).kind {
            ExprKind::Integer { text, .. } => match text.parse::<i64>() {
                Ok(v) => OpalValue::Integer(v),
                Err(_) => {
                    return Err(OpalError::sema(
                        ast.node(id).sl,
                        "integer literal out of range",
                    ))
                }
            },
            ExprKind::String { text, .. } => OpalValue::String(quoting::unquote(text.as_bytes())?),
            _ => continue,
        };
        let loc = heap.alloc(value);
        match &mut ast.node_mut(id).kind {
            ExprKind::Integer { loc: slot, .. } | ExprKind::String { loc: slot, .. } => {
                *slot = Some(loc);
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::ErrorKind;
    use crate::lexer;
    use crate::parser;
    use crate::symbol::SymbolTable;

    fn analyzed(source: &[u8]) -> (Ast, ExprId, SymbolTable) {
        let mut symbols = SymbolTable::new();
        let (mut ast, root) = parser::parse(lexer::lex(source).unwrap(), &mut symbols).unwrap();
        analyze(&mut ast, root).unwrap();
        (ast, root, symbols)
    }

    fn free_names(ast: &Ast, id: ExprId, symbols: &SymbolTable) -> Vec<String> {
        let mut names: Vec<String> = ast
            .node(id)
            .free_vars
            .iter()
            .map(|&s| symbols.name(s).to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn rejects_duplicate_lambda_parameters() {
        let mut symbols = SymbolTable::new();
        let (mut ast, root) =
            parser::parse(lexer::lex(b"lambda (x y x) y").unwrap(), &mut symbols).unwrap();
        let e = analyze(&mut ast, root).unwrap_err();
        assert_eq!(e.kind, ErrorKind::Sema);
        assert_eq!(e.message, "duplicate parameter names");
    }

    #[test]
    fn rejects_duplicate_letrec_binders() {
        let mut symbols = SymbolTable::new();
        let (mut ast, root) =
            parser::parse(lexer::lex(b"letrec (a 1 a 2) a").unwrap(), &mut symbols).unwrap();
        let e = analyze(&mut ast, root).unwrap_err();
        assert_eq!(e.message, "duplicate binding names");
    }

    #[test]
    fn lambda_free_vars_exclude_parameters() {
        let (ast, root, symbols) = analyzed(b"lambda (x) (.+ x y)");
        assert_eq!(free_names(&ast, root, &symbols), vec!["y"]);
    }

    #[test]
    fn letrec_binders_are_bound_in_initializers_and_body() {
        let (ast, root, symbols) = analyzed(b"letrec (f (lambda () (g z)) g (lambda () f)) (f)");
        assert_eq!(free_names(&ast, root, &symbols), vec!["z"]);
    }

    #[test]
    fn at_does_not_reference_its_variable() {
        let (ast, root, symbols) = analyzed(b"@ hidden probe");
        assert_eq!(free_names(&ast, root, &symbols), vec!["probe"]);
    }

    #[test]
    fn lambda_bodies_are_tail_positions() {
        let (ast, root, _) = analyzed(b"lambda (n) (if n (f n) (g n))");
        let ExprKind::Lambda { body, .. } = &ast.node(root).kind else {
            panic!("expected lambda");
        };
        let ExprKind::If {
            cond,
            then_branch,
            else_branch,
        } = &ast.node(*body).kind
        else {
            panic!("expected if body");
        };
        assert!(ast.node(*body).tail);
        assert!(!ast.node(*cond).tail);
        assert!(ast.node(*then_branch).tail);
        assert!(ast.node(*else_branch).tail);
    }

    #[test]
    fn the_root_and_call_arguments_are_not_tail() {
        let (ast, root, _) = analyzed(b"(f (g 1))");
        assert!(!ast.node(root).tail);
        let ExprKind::ExprCall { callee, args } = &ast.node(root).kind else {
            panic!("expected call");
        };
        assert!(!ast.node(*callee).tail);
        assert!(!ast.node(args[0]).tail);
    }

    #[test]
    fn sequence_tail_flag_reaches_only_the_last_element() {
        let (ast, root, _) = analyzed(b"lambda () {(f 1) (f 2)}");
        let ExprKind::Lambda { body, .. } = &ast.node(root).kind else {
            panic!("expected lambda");
        };
        let ExprKind::Sequence { exprs } = &ast.node(*body).kind else {
            panic!("expected sequence");
        };
        assert!(!ast.node(exprs[0]).tail);
        assert!(ast.node(exprs[1]).tail);
    }

    #[test]
    fn preallocation_fills_literal_cells() {
        let mut symbols = SymbolTable::new();
        let (mut ast, root) =
            parser::parse(lexer::lex(b"{-42 \"a\\nb\"}").unwrap(), &mut symbols).unwrap();
        analyze(&mut ast, root).unwrap();
        let mut heap = Heap::new();
        preallocate(&mut ast, &mut heap).unwrap();
        heap.freeze_literals();
        assert_eq!(heap.num_literals(), 2);
        let ExprKind::Sequence { exprs } = &ast.node(root).kind else {
            panic!("expected sequence");
        };
        let ExprKind::Integer { loc: Some(int_loc), .. } = &ast.node(exprs[0]).kind else {
            panic!("integer literal not preallocated");
        };
        let ExprKind::String { loc: Some(str_loc), .. } = &ast.node(exprs[1]).kind else {
            panic!("string literal not preallocated");
        };
        assert_eq!(heap.get(*int_loc).as_integer(), Some(-42));
        assert_eq!(heap.get(*str_loc).as_string(), Some(&b"a\nb"[..]));
    }

    #[test]
    fn oversized_integer_literals_are_sema_errors() {
        let mut symbols = SymbolTable::new();
        let (mut ast, root) = parser::parse(
            lexer::lex(b"99999999999999999999").unwrap(),
            &mut symbols,
        )
        .unwrap();
        analyze(&mut ast, root).unwrap();
        let mut heap = Heap::new();
        let e = preallocate(&mut ast, &mut heap).unwrap_err();
        assert_eq!(e.kind, ErrorKind::Sema);
        assert_eq!(e.message, "integer literal out of range");
    }
}
