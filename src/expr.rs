use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::ops::{Add, AddAssign, Mul, Neg, Sub};
use std::str::FromStr;

/// An affine form over named variables (loop variables, iterators, or parameters).
pub type Affine = AffineForm<String>;

/// A sum of [Term]s plus a constant.
///
/// Forms built through this module's constructors and operators are kept canonical:
/// terms are sorted by atom, atoms are unique, and no coefficient is zero. Two
/// canonical forms are equal exactly when they denote the same function.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct AffineForm<T>(pub Vec<Term<T>>, pub i64);

#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct Term<T>(pub i64, pub T);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("cannot parse affine expression {0:?}")]
pub struct ParseAffineError(pub String);

impl<T> AffineForm<T> {
    pub const fn zero() -> Self {
        AffineForm(vec![], 0)
    }

    pub const fn constant(c: i64) -> Self {
        AffineForm(vec![], c)
    }

    pub fn as_constant(&self) -> Option<i64> {
        if self.0.is_empty() {
            Some(self.1)
        } else {
            None
        }
    }

    pub fn atoms(&self) -> impl Iterator<Item = &T> + '_ {
        self.0.iter().map(|Term(_, a)| a)
    }
}

impl<T: Ord + Clone> AffineForm<T> {
    pub fn var(atom: T) -> Self {
        AffineForm(vec![Term(1, atom)], 0)
    }

    fn canonicalize(mut self) -> Self {
        self.0.sort_by(|a, b| a.1.cmp(&b.1));
        let mut merged: Vec<Term<T>> = Vec::with_capacity(self.0.len());
        for Term(c, a) in self.0.drain(..) {
            match merged.last_mut() {
                Some(Term(lc, la)) if *la == a => *lc += c,
                _ => merged.push(Term(c, a)),
            }
        }
        merged.retain(|Term(c, _)| *c != 0);
        AffineForm(merged, self.1)
    }

    pub fn coefficient(&self, atom: &T) -> i64 {
        self.0
            .iter()
            .find(|Term(_, a)| a == atom)
            .map_or(0, |Term(c, _)| *c)
    }

    pub fn references(&self, atom: &T) -> bool {
        self.coefficient(atom) != 0
    }

    /// Replace every occurrence of `atom` with `replacement`.
    pub fn subs(self, atom: &T, replacement: &AffineForm<T>) -> Self {
        self.map_vars(&mut |a| {
            if &a == atom {
                replacement.clone()
            } else {
                AffineForm::var(a)
            }
        })
    }

    pub fn map_vars<U: Ord + Clone>(self, mapper: &mut impl FnMut(T) -> AffineForm<U>) -> AffineForm<U> {
        let mut accum = AffineForm::constant(self.1);
        for Term(c, a) in self.0 {
            accum += mapper(a) * c;
        }
        accum
    }

    pub fn try_map_vars<U: Ord + Clone, E>(
        self,
        mapper: &mut impl FnMut(T) -> Result<AffineForm<U>, E>,
    ) -> Result<AffineForm<U>, E> {
        let mut accum = AffineForm::constant(self.1);
        for Term(c, a) in self.0 {
            accum += mapper(a)? * c;
        }
        Ok(accum)
    }

    /// Evaluates the form, returning `None` if any atom has no value.
    pub fn eval(&self, mut value_of: impl FnMut(&T) -> Option<i64>) -> Option<i64> {
        let mut total = self.1;
        for Term(c, a) in &self.0 {
            total += c * value_of(a)?;
        }
        Some(total)
    }

    /// The inclusive bounds of the form given inclusive bounds of its atoms.
    pub fn bounds(&self, mut atom_bounds: impl FnMut(&T) -> Option<(i64, i64)>) -> Option<(i64, i64)> {
        let mut minimum = self.1;
        let mut maximum = self.1;
        for Term(coeff, sym) in &self.0 {
            let (sym_min, sym_max) = atom_bounds(sym)?;
            if *coeff < 0 {
                minimum += coeff * sym_max;
                maximum += coeff * sym_min;
            } else {
                minimum += coeff * sym_min;
                maximum += coeff * sym_max;
            }
        }
        Some((minimum, maximum))
    }
}

impl<T: Ord + Clone> Add for AffineForm<T> {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self::Output {
        self.0.extend(rhs.0);
        self.1 += rhs.1;
        self.canonicalize()
    }
}

impl<T: Ord + Clone> AddAssign for AffineForm<T> {
    fn add_assign(&mut self, rhs: Self) {
        let lhs = std::mem::replace(self, AffineForm::zero());
        *self = lhs + rhs;
    }
}

impl<T: Ord + Clone> Add<i64> for AffineForm<T> {
    type Output = Self;

    fn add(mut self, rhs: i64) -> Self::Output {
        self.1 += rhs;
        self
    }
}

impl<T: Ord + Clone> Sub for AffineForm<T> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        self + (-rhs)
    }
}

impl<T: Ord + Clone> Mul<i64> for AffineForm<T> {
    type Output = Self;

    fn mul(self, rhs: i64) -> Self::Output {
        let AffineForm(terms, c) = self;
        AffineForm(terms.into_iter().map(|Term(t, a)| Term(t * rhs, a)).collect(), c * rhs)
            .canonicalize()
    }
}

impl<T: Ord + Clone> Neg for AffineForm<T> {
    type Output = Self;

    fn neg(self) -> Self::Output {
        self * -1
    }
}

impl<T> From<i64> for AffineForm<T> {
    fn from(c: i64) -> Self {
        AffineForm::constant(c)
    }
}

impl From<&str> for AffineForm<String> {
    fn from(atom: &str) -> Self {
        AffineForm::var(atom.to_owned())
    }
}

impl<T: Display> Display for AffineForm<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{}", self.1);
        }
        for (idx, Term(coeff, atom)) in self.0.iter().enumerate() {
            let magnitude = coeff.abs();
            match (idx, *coeff < 0) {
                (0, true) => f.write_str("-")?,
                (0, false) => {}
                (_, true) => f.write_str(" - ")?,
                (_, false) => f.write_str(" + ")?,
            }
            if magnitude == 1 {
                write!(f, "{atom}")?;
            } else {
                write!(f, "{magnitude}*{atom}")?;
            }
        }
        match self.1 {
            0 => Ok(()),
            c if c < 0 => write!(f, " - {}", -c),
            c => write!(f, " + {c}"),
        }
    }
}

impl FromStr for AffineForm<String> {
    type Err = ParseAffineError;

    /// Parses forms such as `N - 1`, `8*i0 + i1`, or `-2*j+3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseAffineError(s.to_owned());
        let compact = s.split_whitespace().collect::<String>();
        if compact.is_empty() {
            return Err(err());
        }

        let mut accum = AffineForm::zero();
        let mut term_start = 0;
        let bytes = compact.as_bytes();
        for idx in 1..=bytes.len() {
            if idx == bytes.len() || bytes[idx] == b'+' || bytes[idx] == b'-' {
                accum += parse_term(&compact[term_start..idx]).ok_or_else(err)?;
                term_start = idx;
            }
        }
        Ok(accum)
    }
}

fn parse_term(term: &str) -> Option<Affine> {
    let (sign, body) = match term.as_bytes().first()? {
        b'+' => (1, &term[1..]),
        b'-' => (-1, &term[1..]),
        _ => (1, term),
    };
    let mut coeff = sign;
    let mut atom: Option<&str> = None;
    for factor in body.split('*') {
        if let Ok(c) = factor.parse::<i64>() {
            coeff *= c;
        } else if is_identifier(factor) && atom.is_none() {
            atom = Some(factor);
        } else {
            return None;
        }
    }
    Some(match atom {
        Some(a) => AffineForm::var(a.to_owned()) * coeff,
        None => AffineForm::constant(coeff),
    })
}

pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn af(s: &str) -> Affine {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display_agree() {
        for s in ["0", "i", "8*i0 + i1", "-j + 3", "N - 1", "2*i - 3*j - 7"] {
            assert_eq!(af(s).to_string(), s);
        }
    }

    #[test]
    fn test_parse_merges_repeated_atoms() {
        assert_eq!(af("i + 2*i - 3"), af("3*i - 3"));
        assert_eq!(af("i - i"), AffineForm::zero());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Affine>().is_err());
        assert!("i*j".parse::<Affine>().is_err());
        assert!("3i".parse::<Affine>().is_err());
        assert!("(i)".parse::<Affine>().is_err());
    }

    #[test]
    fn test_subs_tiled_variable() {
        let bound = af("i + 1");
        let subbed = bound.subs(&"i".to_owned(), &af("8*i0 + i1"));
        assert_eq!(subbed, af("8*i0 + i1 + 1"));
    }

    #[test]
    fn test_bounds_handles_negative_coefficients() {
        let e = af("10 - 2*i");
        assert_eq!(e.bounds(|_| Some((0, 3))), Some((4, 10)));
    }

    proptest! {
        #[test]
        fn test_eval_is_linear(a in -50i64..50, b in -50i64..50, x in -20i64..20, y in -20i64..20) {
            let e = AffineForm::var("x".to_owned()) * a + AffineForm::var("y".to_owned()) * b + 3;
            let v = e.eval(|n| if n == "x" { Some(x) } else { Some(y) });
            prop_assert_eq!(v, Some(a * x + b * y + 3));
            let reparsed: Affine = e.to_string().parse().unwrap();
            prop_assert_eq!(reparsed, e);
        }
    }
}
