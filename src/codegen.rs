//! Renders input AST nodes back into source text.
//!
//! Diagnostics quote the offending subexpression; the producer only keys
//! external nodes with their source, so everything else is reconstructed
//! here.

use itertools::Itertools;

use crate::ast::{Expr, ExprKind, GenExpr, Literal, Qualifier, Subscript};

/// The source text of a node: the producer-supplied key when present,
/// otherwise a rendering of the AST.
pub fn ast2src(expr: &Expr) -> String {
    match &expr.src {
        Some(src) => src.clone(),
        None => expr.to_string(),
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&write_expr(self, false))
    }
}

impl std::fmt::Display for GenExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", write_expr(&self.expr, false))?;
        for qual in &self.quals {
            write!(f, " {}", write_qualifier(qual))?;
        }
        Ok(())
    }
}

fn write_qualifier(qual: &Qualifier) -> String {
    let mut out = format!(
        "for {} in {}",
        write_expr(&qual.assign, false),
        write_expr(&qual.iter, false)
    );
    for test in &qual.ifs {
        out += &format!(" if {}", write_expr(test, false));
    }
    out
}

fn write_expr(expr: &Expr, parenthesize: bool) -> String {
    if let Some(src) = &expr.src {
        return src.clone();
    }
    let (text, compound) = match &expr.kind {
        ExprKind::Name(name) => (name.clone(), false),
        ExprKind::Getattr { expr, attr } => (format!("{}.{attr}", write_expr(expr, true)), false),
        ExprKind::Literal(value) => (write_literal(value), false),
        ExprKind::Tuple(items) => (
            format!("({})", items.iter().map(|e| write_expr(e, false)).join(", ")),
            false,
        ),
        ExprKind::List(items) => (
            format!("[{}]", items.iter().map(|e| write_expr(e, false)).join(", ")),
            false,
        ),
        ExprKind::Binary { left, op, right } => (
            format!(
                "{} {} {}",
                write_expr(left, true),
                op.symbol(),
                write_expr(right, true)
            ),
            true,
        ),
        ExprKind::Neg(operand) => (format!("-{}", write_expr(operand, true)), true),
        ExprKind::Compare { left, ops } => {
            let mut out = write_expr(left, true);
            for (op, right) in ops {
                out += &format!(" {} {}", op.symbol(), write_expr(right, true));
            }
            (out, true)
        }
        ExprKind::And(items) => (
            items.iter().map(|e| write_expr(e, true)).join(" and "),
            true,
        ),
        ExprKind::Or(items) => (
            items.iter().map(|e| write_expr(e, true)).join(" or "),
            true,
        ),
        ExprKind::Not(operand) => (format!("not {}", write_expr(operand, true)), true),
        ExprKind::Call {
            func,
            args,
            keywords,
            star_args,
            dstar_args,
        } => {
            let mut parts: Vec<String> = args.iter().map(|a| write_expr(a, false)).collect();
            parts.extend(
                keywords
                    .iter()
                    .map(|(name, value)| format!("{name}={}", write_expr(value, false))),
            );
            if let Some(star) = star_args {
                parts.push(format!("*{}", write_expr(star, false)));
            }
            if let Some(dstar) = dstar_args {
                parts.push(format!("**{}", write_expr(dstar, false)));
            }
            (
                format!("{}({})", write_expr(func, true), parts.join(", ")),
                false,
            )
        }
        ExprKind::Subscript { expr, index } => {
            let index = match index {
                Subscript::Item(item) => write_expr(item, false),
                Subscript::Tuple(items) => {
                    items.iter().map(|e| write_expr(e, false)).join(", ")
                }
                Subscript::Slice { lower, upper, step } => {
                    let part = |e: &Option<Box<Expr>>| {
                        e.as_ref().map(|e| write_expr(e, false)).unwrap_or_default()
                    };
                    let mut out = format!("{}:{}", part(lower), part(upper));
                    if step.is_some() {
                        out += &format!(":{}", part(step));
                    }
                    out
                }
            };
            (format!("{}[{index}]", write_expr(expr, true)), false)
        }
        ExprKind::Lambda { params, body, .. } => (
            format!("lambda {}: {}", params.join(", "), write_expr(body, false)),
            true,
        ),
        ExprKind::Comprehension(inner) => (format!("({inner})"), false),
    };
    if parenthesize && compound {
        format!("({text})")
    } else {
        text
    }
}

fn write_literal(value: &Literal) -> String {
    match value {
        Literal::Null => "None".to_string(),
        Literal::String(s) => format!("'{}'", s.replace('\'', "\\'")),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, CmpOp};

    #[test]
    fn test_render_compare_chain() {
        let expr = Expr::new(ExprKind::Compare {
            left: Box::new(Expr::name("s").getattr("age")),
            ops: vec![(CmpOp::Gt, Expr::literal(Literal::Int(18)))],
        });
        assert_eq!(ast2src(&expr), "s.age > 18");
    }

    #[test]
    fn test_src_key_wins() {
        let expr = Expr::name("x").external("outer_x");
        assert_eq!(ast2src(&expr), "outer_x");
    }

    #[test]
    fn test_render_binary_nested() {
        let expr = Expr::new(ExprKind::Binary {
            left: Box::new(Expr::new(ExprKind::Binary {
                left: Box::new(Expr::name("a")),
                op: BinOp::Add,
                right: Box::new(Expr::name("b")),
            })),
            op: BinOp::Mul,
            right: Box::new(Expr::name("c")),
        });
        assert_eq!(ast2src(&expr), "(a + b) * c");
    }
}
