//! Splitting migration bodies into individual statements.

use std::iter::Peekable;
use std::str::Chars;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Code,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
    DollarQuoted(String),
}

/// Split SQL into individual statements.
///
/// Semicolons inside string literals, quoted identifiers, comments and
/// PostgreSQL dollar-quoted bodies (`$$ ... $$`, `$tag$ ... $tag$`) do not end
/// a statement. Statements consisting only of comments are dropped.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_code = false;
    let mut state = State::Code;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                ';' => {
                    if has_code {
                        statements.push(current.trim().to_string());
                    }
                    current.clear();
                    has_code = false;
                    continue;
                }
                '\'' => {
                    state = State::SingleQuoted;
                    has_code = true;
                }
                '"' => {
                    state = State::DoubleQuoted;
                    has_code = true;
                }
                '-' if chars.peek() == Some(&'-') => state = State::LineComment,
                '/' if chars.peek() == Some(&'*') => state = State::BlockComment,
                '$' => {
                    has_code = true;
                    if let Some(tag) = dollar_tag(&chars) {
                        current.push_str(&tag);
                        advance(&mut chars, tag.chars().count() - 1);
                        state = State::DollarQuoted(tag);
                        continue;
                    }
                }
                c if !c.is_whitespace() => has_code = true,
                _ => {}
            },
            State::SingleQuoted if c == '\'' => state = State::Code,
            State::DoubleQuoted if c == '"' => state = State::Code,
            State::LineComment if c == '\n' => state = State::Code,
            State::BlockComment if c == '*' && chars.peek() == Some(&'/') => {
                current.push_str("*/");
                chars.next();
                state = State::Code;
                continue;
            }
            State::DollarQuoted(ref tag) if c == '$' => {
                if dollar_tag(&chars).as_deref() == Some(tag.as_str()) {
                    let len = tag.chars().count();
                    current.push_str(tag);
                    advance(&mut chars, len - 1);
                    state = State::Code;
                    continue;
                }
            }
            _ => {}
        }

        current.push(c);
    }

    // The last statement may not end with ;
    if has_code {
        statements.push(current.trim().to_string());
    }

    statements
}

/// If the characters after a `$` complete a dollar-quote tag, return the whole
/// tag including both `$` signs. Positional parameters like `$1` are not tags.
fn dollar_tag(rest: &Peekable<Chars<'_>>) -> Option<String> {
    let mut tag = String::from("$");
    for (i, c) in rest.clone().enumerate() {
        match c {
            '$' => {
                tag.push('$');
                return Some(tag);
            }
            c if i == 0 && c.is_ascii_digit() => return None,
            c if c.is_alphanumeric() || c == '_' => tag.push(c),
            _ => return None,
        }
    }
    None
}

fn advance(chars: &mut Peekable<Chars<'_>>, n: usize) {
    for _ in 0..n {
        chars.next();
    }
}
