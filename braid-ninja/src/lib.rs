//! A thin formatter for the Ninja manifest syntax.
//!
//! This crate knows nothing about modules or variants; it turns already
//! resolved names and strings into correctly escaped, line-wrapped Ninja
//! text. Statement ordering is the caller's concern.

use std::io::{self, Write};

const LINE_WIDTH: usize = 80;
const INDENT: &str = "    ";

/// Escapes a string for use as a path in a build statement. Spaces, colons
/// and `$` must not be interpreted by Ninja.
pub fn escape_path(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("$ "),
            ':' => out.push_str("$:"),
            '$' => out.push_str("$$"),
            _ => out.push(c),
        }
    }
    out
}

/// Escapes a string for use as a variable value. Only `$` is special there;
/// embedded newlines are a caller bug.
pub fn escape_value(s: &str) -> String {
    debug_assert!(!s.contains('\n'), "ninja values cannot contain newlines");
    s.replace('$', "$$")
}

/// Returns whether `s` is usable as a Ninja identifier (rule, pool or
/// variable name).
pub fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Writes Ninja statements to an underlying writer, wrapping long lines with
/// `$` continuations.
pub struct Writer<W: Write> {
    out: W,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W) -> Writer<W> {
        Writer { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn blank_line(&mut self) -> io::Result<()> {
        writeln!(self.out)
    }

    /// Writes a comment, wrapped at the line width on word boundaries.
    pub fn comment(&mut self, text: &str) -> io::Result<()> {
        let mut line = String::from("#");
        for word in text.split_whitespace() {
            if line.len() + 1 + word.len() > LINE_WIDTH && line.len() > 1 {
                writeln!(self.out, "{}", line)?;
                line = String::from("#");
            }
            line.push(' ');
            line.push_str(word);
        }
        writeln!(self.out, "{}", line)
    }

    /// Writes a comment exactly as given, without wrapping. Used for the
    /// aligned header table.
    pub fn raw_comment(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "# {}", text)
    }

    pub fn variable(&mut self, name: &str, value: &str, indent: usize) -> io::Result<()> {
        debug_assert!(is_valid_identifier(name), "invalid variable name {:?}", name);
        for _ in 0..indent {
            write!(self.out, "{}", INDENT)?;
        }
        writeln!(self.out, "{} = {}", name, value)
    }

    pub fn pool(&mut self, name: &str, depth: i64) -> io::Result<()> {
        debug_assert!(is_valid_identifier(name), "invalid pool name {:?}", name);
        writeln!(self.out, "pool {}", name)?;
        self.variable("depth", &depth.to_string(), 1)
    }

    /// Starts a rule statement. Rule variables follow via `variable(.., 1)`.
    pub fn rule(&mut self, name: &str) -> io::Result<()> {
        debug_assert!(is_valid_identifier(name), "invalid rule name {:?}", name);
        writeln!(self.out, "rule {}", name)
    }

    /// Writes a build statement. All paths must already be escaped.
    pub fn build(
        &mut self,
        outputs: &[String],
        implicit_outputs: &[String],
        rule: &str,
        inputs: &[String],
        implicits: &[String],
        order_only: &[String],
    ) -> io::Result<()> {
        let mut line = WrappedLine::new("build");
        for out in outputs {
            line.word(out);
        }
        if !implicit_outputs.is_empty() {
            line.word("|");
            for out in implicit_outputs {
                line.word(out);
            }
        }
        line.word_nobreak(&format!(": {}", rule));
        for input in inputs {
            line.word(input);
        }
        if !implicits.is_empty() {
            line.word("|");
            for dep in implicits {
                line.word(dep);
            }
        }
        if !order_only.is_empty() {
            line.word("||");
            for dep in order_only {
                line.word(dep);
            }
        }
        line.finish(&mut self.out)
    }

    pub fn default(&mut self, targets: &[String]) -> io::Result<()> {
        let mut line = WrappedLine::new("default");
        for t in targets {
            line.word(t);
        }
        line.finish(&mut self.out)
    }

    pub fn subninja(&mut self, path: &str) -> io::Result<()> {
        writeln!(self.out, "subninja {}", path)
    }
}

/// Accumulates words and breaks them across lines with `$` continuations.
struct WrappedLine {
    text: String,
    col: usize,
}

impl WrappedLine {
    fn new(start: &str) -> WrappedLine {
        WrappedLine { text: start.to_string(), col: start.len() }
    }

    fn word(&mut self, w: &str) {
        if self.col + 1 + w.len() > LINE_WIDTH {
            self.text.push_str(" $\n");
            self.text.push_str(INDENT);
            self.text.push_str(INDENT);
            self.col = INDENT.len() * 2;
        } else {
            self.text.push(' ');
            self.col += 1;
        }
        self.text.push_str(w);
        self.col += w.len();
    }

    /// Appends without allowing a break before the word. Used for the
    /// `: rulename` separator, which Ninja requires on the first line of the
    /// output list's line.
    fn word_nobreak(&mut self, w: &str) {
        self.text.push_str(w);
        self.col += w.len();
    }

    fn finish(self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "{}", self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(f: impl FnOnce(&mut Writer<&mut Vec<u8>>)) -> String {
        let mut buf = Vec::new();
        {
            let mut w = Writer::new(&mut buf);
            f(&mut w);
        }
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn escaping() {
        assert_eq!(escape_path("a b:c$d"), "a$ b$:c$$d");
        assert_eq!(escape_value("x$y"), "x$$y");
        assert!(is_valid_identifier("cc_1.2-x"));
        assert!(!is_valid_identifier("a b"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn simple_build_statement() {
        let text = render(|w| {
            w.build(
                &["out.o".to_string()],
                &[],
                "cc",
                &["in.c".to_string()],
                &["cc.sh".to_string()],
                &["gen".to_string()],
            )
            .unwrap();
        });
        assert_eq!(text, "build out.o: cc in.c | cc.sh || gen\n");
    }

    #[test]
    fn long_build_lines_wrap_with_continuations() {
        let inputs: Vec<String> = (0..20).map(|i| format!("dir/input_{:02}.c", i)).collect();
        let text = render(|w| {
            w.build(&["out.o".to_string()], &[], "cc", &inputs, &[], &[]).unwrap();
        });
        for line in text.lines() {
            assert!(line.len() <= LINE_WIDTH + 2, "line too long: {:?}", line);
        }
        assert!(text.contains(" $\n"));
        // Reassembling the wrapped text yields every input.
        let flat = text.replace(" $\n        ", " ");
        for input in &inputs {
            assert!(flat.contains(input.as_str()));
        }
    }

    #[test]
    fn rule_with_variables() {
        let text = render(|w| {
            w.rule("cc").unwrap();
            w.variable("command", "gcc -c ${in} -o ${out}", 1).unwrap();
            w.variable("description", "CC ${out}", 1).unwrap();
        });
        assert_eq!(
            text,
            "rule cc\n    command = gcc -c ${in} -o ${out}\n    description = CC ${out}\n"
        );
    }

    #[test]
    fn comments_wrap_on_words() {
        let text = render(|w| {
            let long = "word ".repeat(40);
            w.comment(&long).unwrap();
        });
        assert!(text.lines().count() > 1);
        for line in text.lines() {
            assert!(line.starts_with('#'));
            assert!(line.len() <= LINE_WIDTH + 1);
        }
    }

    #[test]
    fn pool_and_subninja() {
        let text = render(|w| {
            w.pool("link", 4).unwrap();
            w.subninja("sub/build.ninja").unwrap();
        });
        assert_eq!(text, "pool link\n    depth = 4\nsubninja sub/build.ninja\n");
    }
}
