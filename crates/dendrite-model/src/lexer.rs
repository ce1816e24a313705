//! Lexical analysis for equation text.
//!
//! Tokenization uses logos. Identifiers cover ordinary names, `$` specials,
//! and trailing apostrophes for derivative orders (`x''`, `$t'`).

use logos::Logos;

/// Equation-language token.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].replace("\\\"", "\"")
    })]
    Str(String),

    #[regex(r"[A-Za-z_$][A-Za-z0-9_$]*'*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("^")]
    Caret,
    #[token("==")]
    EqEq,
    #[token("!=")]
    BangEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token(".")]
    Dot,
}

/// Tokenize a full string, reporting the byte offset of any bad character.
pub fn tokenize(source: &str) -> Result<Vec<Token>, usize> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next() {
        match token {
            Ok(t) => tokens.push(t),
            Err(()) => return Err(lexer.span().start),
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_and_ops() {
        let tokens = tokenize("1.5e2 + x*2").unwrap();
        assert_eq!(tokens[0], Token::Number(150.0));
        assert_eq!(tokens[1], Token::Plus);
        assert_eq!(tokens[2], Token::Ident("x".into()));
    }

    #[test]
    fn specials_and_orders() {
        let tokens = tokenize("$t' $index V''").unwrap();
        assert_eq!(tokens[0], Token::Ident("$t'".into()));
        assert_eq!(tokens[1], Token::Ident("$index".into()));
        assert_eq!(tokens[2], Token::Ident("V''".into()));
    }

    #[test]
    fn dotted_path_splits() {
        let tokens = tokenize("A.B").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("A".into()),
                Token::Dot,
                Token::Ident("B".into())
            ]
        );
    }

    #[test]
    fn strings() {
        let tokens = tokenize(r#"output("out", x)"#).unwrap();
        assert_eq!(tokens[2], Token::Str("out".into()));
    }

    #[test]
    fn bad_character_position() {
        assert_eq!(tokenize("x # y"), Err(2));
    }
}
