use std::collections::HashSet;
use std::fmt;
use std::io;
use std::iter;

const INDENT_SIZE: usize = 2;

/// Wraps an [io::Write] for use as a [fmt::Write].
pub struct ToWriteFmt<T: io::Write>(pub T);

// Wraps a [fmt::Write] to prepend [str] to each line.
pub struct LinePrefixWrite<'a, W: fmt::Write>(W, &'a str, bool);

impl<T: io::Write> fmt::Write for ToWriteFmt<T> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

impl<'a, W: fmt::Write> LinePrefixWrite<'a, W> {
    pub fn new(inner: W, line_prefix: &'a str) -> Self {
        LinePrefixWrite(inner, line_prefix, true)
    }
}

impl<'a, W: fmt::Write> fmt::Write for LinePrefixWrite<'a, W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.2 && !s.is_empty() {
            self.0.write_str(self.1)?;
        }

        let mut split_iter = s.split_inclusive('\n').peekable();
        while let Some(substring) = split_iter.next() {
            self.0.write_str(substring)?;
            if split_iter.peek().is_some() {
                self.0.write_str(self.1)?;
            }
        }
        self.2 = s.ends_with('\n');
        Ok(())
    }
}

pub fn indent(depth: usize) -> String {
    iter::repeat(' ').take(depth * INDENT_SIZE).collect()
}

/// Returns `base` if it is not taken, otherwise `base` with the smallest numeric
/// suffix (`_1`, `_2`, ...) that is free.
pub fn fresh_name(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_owned();
    }
    (1..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_line_prefix_write_prefixes_each_line() {
        let mut out = String::new();
        let mut w = LinePrefixWrite::new(&mut out, "// ");
        write!(w, "a\nb").unwrap();
        writeln!(w, "c").unwrap();
        write!(w, "d").unwrap();
        assert_eq!(out, "// a\n// bc\n// d");
    }

    #[test]
    fn test_fresh_name_skips_taken() {
        let taken = ["i", "i_1"].into_iter().map(String::from).collect();
        assert_eq!(fresh_name("j", &taken), "j");
        assert_eq!(fresh_name("i", &taken), "i_2");
    }

    #[test]
    fn test_indent() {
        assert_eq!(indent(0), "");
        assert_eq!(indent(3), "      ");
    }
}
