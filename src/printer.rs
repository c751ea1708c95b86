use crate::ast::Ast;
use crate::quoting;
use crate::value::OpalValue;

/// Render a value in its printed form, as raw output bytes. Strings are
/// quoted the way `.quote` quotes them; closures report the source
/// location of the lambda they were evaluated at.
pub fn render(value: &OpalValue, ast: &Ast) -> Vec<u8> {
    match value {
        OpalValue::Void => b"<void>".to_vec(),
        OpalValue::Integer(v) => v.to_string().into_bytes(),
        OpalValue::String(s) => quoting::quote(s),
        OpalValue::Closure(c) => {
            format!("<closure evaluated at {}>", ast.node(c.lambda).sl).into_bytes()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn scalar_forms() {
        let ast = Ast::new();
        assert_eq!(render(&OpalValue::Void, &ast), b"<void>".to_vec());
        assert_eq!(render(&OpalValue::Integer(-7), &ast), b"-7".to_vec());
        assert_eq!(
            render(&OpalValue::String(b"a\"b".to_vec()), &ast),
            b"\"a\\\"b\"".to_vec()
        );
    }
}
