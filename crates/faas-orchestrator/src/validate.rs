//! Pre-deployment checks on function source and target names.
//!
//! The source check is a lightweight syntax pass. It tokenizes strings,
//! comments and brackets, joins physical lines into logical lines, then
//! checks block structure (compound headers end in `:`, every header is
//! followed by an indented block, dedents land on an enclosing level) and
//! operator placement. A top-level `def main(` or `async def main(` is
//! required.

use faas_common::{FaasError, Result};

/// Project and function names become path components, so only a
/// conservative character set is accepted.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with(['.', '-'])
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(FaasError::Validation(format!("Invalid {} name: {:?}", kind, name)))
    }
}

/// Checks a deployment payload before anything touches the filesystem.
pub fn validate_function_code(code: &[u8]) -> Result<()> {
    let source = std::str::from_utf8(code)
        .map_err(|e| FaasError::Validation(format!("Invalid function code: {}", e)))?;
    if source.trim().is_empty() {
        return Err(FaasError::Validation(
            "Function code must not be empty".to_string(),
        ));
    }

    let scan = scan(source)
        .and_then(|scan| check_structure(&scan.lines).map(|_| scan))
        .map_err(|reason| FaasError::Validation(format!("Invalid function code: {}", reason)))?;
    if !scan.has_main {
        return Err(FaasError::Validation(
            "Function code must define a main function".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Quote {
    Single(char),
    Triple(char),
}

/// One statement line after joining bracketed, continued and multi-line
/// string spans. String literals are reduced to `0` and comments dropped.
#[derive(Debug)]
struct LogicalLine {
    lineno: usize,
    indent: usize,
    code: String,
}

struct Scan {
    has_main: bool,
    lines: Vec<LogicalLine>,
}

const COMPOUND_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "for", "while", "try", "except", "finally", "with", "def", "class",
];

const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "==", "!=", "<=", ">=", "//", "**", "<<", ">>", "+=", "-=", "*=",
    "/=", "%=", "@=", "&=", "|=", "^=", "->", "+", "-", "*", "/", "%", "@", "&", "|", "^", "<",
    ">", "=", "~", "!",
];

/// Operators that can never begin an operand.
const BINARY_ONLY: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "==", "!=", "<=", ">=", "//", "<<", ">>", "+=", "-=", "*=", "/=",
    "%=", "@=", "&=", "|=", "^=", "->", "/", "%", "@", "&", "|", "^", "<", ">", "=", "!",
];

const WORD_OPERATORS: &[&str] = &["and", "or", "not", "in", "is"];

fn scan(source: &str) -> std::result::Result<Scan, String> {
    let mut quote: Option<Quote> = None;
    let mut brackets: Vec<(char, usize)> = Vec::new();
    let mut continued = false;
    let mut has_main = false;
    let mut last_line = 0;
    let mut lines = Vec::new();
    let mut current: Option<LogicalLine> = None;

    for (idx, line) in source.lines().enumerate() {
        let lineno = idx + 1;
        last_line = lineno;

        if quote.is_none() && brackets.is_empty() && !continued {
            let stripped = line.trim_start();
            if !stripped.is_empty() && !stripped.starts_with('#') {
                let indent = indent_width(line);
                if indent == 0 && declares_main(stripped) {
                    has_main = true;
                }
                current = Some(LogicalLine {
                    lineno,
                    indent,
                    code: String::new(),
                });
            }
        }

        continued = false;
        let mut escaped_newline = false;
        let mut code = String::new();
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match quote {
                Some(Quote::Triple(q)) => {
                    if c == '\\' {
                        i += 2;
                        continue;
                    }
                    if c == q && chars.get(i + 1) == Some(&q) && chars.get(i + 2) == Some(&q) {
                        quote = None;
                        i += 3;
                        continue;
                    }
                }
                Some(Quote::Single(q)) => {
                    if c == '\\' {
                        if i + 1 == chars.len() {
                            escaped_newline = true;
                        }
                        i += 2;
                        continue;
                    }
                    if c == q {
                        quote = None;
                    }
                }
                None => match c {
                    '#' => break,
                    '\'' | '"' => {
                        code.push('0');
                        if chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                            quote = Some(Quote::Triple(c));
                            i += 3;
                            continue;
                        }
                        quote = Some(Quote::Single(c));
                    }
                    '(' | '[' | '{' => {
                        code.push(c);
                        brackets.push((c, lineno));
                    }
                    ')' | ']' | '}' => {
                        code.push(c);
                        let expected = match c {
                            ')' => '(',
                            ']' => '[',
                            _ => '{',
                        };
                        match brackets.pop() {
                            Some((open, _)) if open == expected => {}
                            Some((open, opened_at)) => {
                                return Err(format!(
                                    "'{}' at line {} does not match '{}' opened at line {}",
                                    c, lineno, open, opened_at
                                ))
                            }
                            None => return Err(format!("unmatched '{}' at line {}", c, lineno)),
                        }
                    }
                    '\\' if i + 1 == chars.len() => continued = true,
                    _ => code.push(c),
                },
            }
            i += 1;
        }

        if matches!(quote, Some(Quote::Single(_))) && !escaped_newline {
            return Err(format!("unterminated string literal at line {}", lineno));
        }

        if let Some(logical) = current.as_mut() {
            logical.code.push_str(&code);
            logical.code.push(' ');
        }
        if quote.is_none() && brackets.is_empty() && !continued {
            if let Some(mut logical) = current.take() {
                logical.code.truncate(logical.code.trim_end().len());
                lines.push(logical);
            }
        }
    }

    if matches!(quote, Some(Quote::Triple(_))) {
        return Err("unterminated triple-quoted string".to_string());
    }
    if let Some((open, opened_at)) = brackets.pop() {
        return Err(format!("'{}' opened at line {} was never closed", open, opened_at));
    }
    if continued {
        return Err(format!("unexpected end of file after line continuation at line {}", last_line));
    }
    Ok(Scan { has_main, lines })
}

/// Tabs advance to the next multiple of eight, as the tokenizer does.
fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width = (width / 8 + 1) * 8,
            '\x0c' => width = 0,
            _ => break,
        }
    }
    width
}

fn check_structure(lines: &[LogicalLine]) -> std::result::Result<(), String> {
    let mut levels = vec![0usize];
    let mut open_block: Option<usize> = None;

    for line in lines {
        let top = levels.last().copied().unwrap_or(0);
        match open_block.take() {
            Some(header) if line.indent <= top => {
                return Err(format!("expected an indented block after line {}", header));
            }
            Some(_) => levels.push(line.indent),
            None if line.indent > top => {
                return Err(format!("unexpected indent at line {}", line.lineno));
            }
            None => {
                while levels.last().is_some_and(|level| *level > line.indent) {
                    levels.pop();
                }
                if levels.last() != Some(&line.indent) {
                    return Err(format!(
                        "unindent does not match any outer indentation level at line {}",
                        line.lineno
                    ));
                }
            }
        }

        check_statement(line)?;
        if line.code.ends_with(':') {
            open_block = Some(line.lineno);
        }
    }

    match open_block {
        Some(header) => Err(format!("expected an indented block after line {}", header)),
        None => Ok(()),
    }
}

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Op(&'static str),
    Word(&'a str),
}

fn is_operator_char(c: char) -> bool {
    "+-*/%@&|^<>=~!".contains(c)
}

fn tokenize(code: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut rest = code;
    while let Some(c) = rest.chars().next() {
        if c.is_whitespace() {
            rest = &rest[c.len_utf8()..];
        } else if is_operator_char(c) {
            // Longest match first; the table is ordered by length.
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(*op))
                .copied()
                .unwrap_or("!");
            tokens.push(Token::Op(op));
            rest = &rest[op.len().min(rest.len())..];
        } else {
            let end = rest
                .find(|c: char| c.is_whitespace() || is_operator_char(c))
                .unwrap_or(rest.len());
            tokens.push(Token::Word(&rest[..end]));
            rest = &rest[end..];
        }
    }
    tokens
}

fn check_statement(line: &LogicalLine) -> std::result::Result<(), String> {
    let invalid = || Err(format!("invalid syntax at line {}", line.lineno));
    let code = line.code.as_str();

    let mut words = code
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty());
    let first = words.next().unwrap_or("");
    let header = COMPOUND_KEYWORDS.contains(&first)
        || (first == "async" && matches!(words.next(), Some("def" | "for" | "with")));
    if header && !has_top_level_colon(code) {
        return Err(format!("expected ':' at line {}", line.lineno));
    }

    let tokens = tokenize(code);
    if let Some(Token::Op(op)) = tokens.first() {
        if *op != "@" && BINARY_ONLY.contains(op) {
            return invalid();
        }
    }
    for pair in tokens.windows(2) {
        if let [Token::Op(_), Token::Op(next)] = pair {
            if BINARY_ONLY.contains(next) {
                return invalid();
            }
        }
    }
    match tokens.as_slice() {
        [.., Token::Word("import"), Token::Op("*")] => {}
        [.., Token::Op(_)] => return invalid(),
        [.., Token::Word(word)] if WORD_OPERATORS.contains(word) => return invalid(),
        _ => {}
    }
    Ok(())
}

fn has_top_level_colon(code: &str) -> bool {
    let mut depth = 0usize;
    for c in code.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

/// Matches `def main(` and `async def main(` with arbitrary inner spacing.
fn declares_main(line: &str) -> bool {
    let rest = match line.strip_prefix("async") {
        Some(r) if r.starts_with(char::is_whitespace) => r.trim_start(),
        Some(_) => return false,
        None => line,
    };
    let Some(rest) = rest.strip_prefix("def") else {
        return false;
    };
    if !rest.starts_with(char::is_whitespace) {
        return false;
    }
    match rest.trim_start().strip_prefix("main") {
        Some(rest) => rest.trim_start().starts_with('('),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(code: &str) -> String {
        match validate_function_code(code.as_bytes()) {
            Err(FaasError::Validation(msg)) => msg,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_accepts_sync_and_async_main() {
        validate_function_code(b"def main(event):\n    return {'ok': True}\n").unwrap();
        validate_function_code(b"import asyncio\n\nasync  def   main (event):\n    await asyncio.sleep(0)\n")
            .unwrap();
    }

    #[test]
    fn test_rejects_empty_and_whitespace() {
        assert!(reason("").contains("must not be empty"));
        assert!(reason("  \n\t\n").contains("must not be empty"));
    }

    #[test]
    fn test_requires_top_level_main() {
        assert!(reason("def handler(event):\n    return 1\n").contains("main function"));
        assert!(reason("class App:\n    def main(self):\n        pass\n").contains("main function"));
        assert!(reason("x = 'def main('\n").contains("main function"));
        assert!(reason("def mainly(event):\n    pass\n").contains("main function"));
    }

    #[test]
    fn test_rejects_lexical_errors() {
        assert!(reason("def main(event:\n    return 1\n").contains("never closed"));
        assert!(reason("def main(event]:\n    pass\n").contains("does not match"));
        assert!(reason("def main(event):\n    return 'oops\n").contains("unterminated string"));
        assert!(reason("def main(event):\n    \"\"\"doc\n").contains("triple-quoted"));
        assert!(reason("    def main(event):\n        pass\n").contains("unexpected indent"));
        assert!(reason(")\ndef main():\n    pass\n").contains("unmatched"));
    }

    #[test]
    fn test_strings_and_comments_do_not_confuse_brackets() {
        let code = "# (unbalanced in a comment\n\
                    def main(event):\n    \
                    s = \")]}\"\n    \
                    doc = '''multi\n(line\n'''\n    \
                    return s + \\\n        doc\n";
        validate_function_code(code.as_bytes()).unwrap();
    }

    #[test]
    fn test_rejects_statement_structure_errors() {
        assert!(reason("def main()\n    return 1\n").contains("expected ':' at line 1"));
        assert!(reason("def main(event):\nreturn 1\n").contains("indented block after line 1"));
        assert!(reason("def main(event):\n    x = = 1\n").contains("invalid syntax at line 2"));
        assert!(reason("def main(event):\n    return 1 +\n").contains("invalid syntax at line 2"));
        assert!(reason("def main(event):\n    if event\n        pass\n").contains("expected ':'"));
        assert!(reason("def main(event):\n    return event and\n").contains("invalid syntax"));
        assert!(reason("def main(event):\n").contains("indented block after line 1"));
        assert!(reason("def main(event):\n        a = 1\n    b = 2\n").contains("unindent"));
        assert!(reason("def main(event):\n    x += = 1\n").contains("invalid syntax"));
    }

    #[test]
    fn test_accepts_common_constructs() {
        let code = "\
from os.path import *
import json


@decorator(name='x')
def helper(a: int, *args, b=-1, **kwargs) -> int:
    return a ** -b if a else ~a


class Handler:
    \"\"\"Docstring with def main() and a dangling +\"\"\"

    def run(self, event):  # trailing comment:
        for key, value in event.items(): print(key, value, sep='')
        data = {
            'a': [1, 2][::-1],
            'b': (lambda x: x)(3),
        }
        while False:
            pass
        else:
            pass
        return data


async def main(event):
    total = 1 + \\
        2
    try:
        result = json.dumps(event) % total
    except (ValueError, TypeError) as exc:
        raise RuntimeError(f\"bad {exc!r}\") from exc
    finally:
        x = not total
    return result
";
        validate_function_code(code.as_bytes()).unwrap();
        validate_function_code(b"def main(event):\n\treturn event\n").unwrap();
    }

    #[test]
    fn test_rejects_non_utf8() {
        assert!(reason_bytes(&[0x64, 0x65, 0x66, 0xff]).contains("Invalid function code"));
    }

    fn reason_bytes(code: &[u8]) -> String {
        match validate_function_code(code) {
            Err(FaasError::Validation(msg)) => msg,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_names() {
        validate_name("function", "hello_world").unwrap();
        validate_name("project", "my-project-2").unwrap();
        assert!(validate_name("function", "").is_err());
        assert!(validate_name("function", "../etc/passwd").is_err());
        assert!(validate_name("function", ".hidden").is_err());
        assert!(validate_name("project", "a/b").is_err());
    }
}
