// Re-traversable wrapper around a single-pass sequence factory.
//
// Every stage of the pipeline is a lazy, single-pass iterator (an archive
// being decompressed, a batch of external conversions in flight). Some
// consumers need to walk a stage more than once, e.g. a counting pass over
// the corpus followed by the real build. `Restartable` stores the factory
// instead of the iterator and calls it again for every traversal.
//
// Nothing is cached: each pass re-runs the factory from scratch, including
// whatever side effects it has (reopening files, spawning tools).

/// A sequence that can be traversed any number of times by rebuilding it
/// from a stored factory.
pub struct Restartable<F> {
    factory: F,
}

impl<F, I> Restartable<F>
where
    F: Fn() -> I,
    I: IntoIterator,
{
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    /// Start a fresh, independent pass over the sequence.
    pub fn iter(&self) -> I::IntoIter {
        (self.factory)().into_iter()
    }
}

impl<'a, F, I> IntoIterator for &'a Restartable<F>
where
    F: Fn() -> I,
    I: IntoIterator,
{
    type Item = I::Item;
    type IntoIter = I::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn traverses_repeatedly() {
        let seq = Restartable::new(|| (0..4).map(|x| x * 10));
        let first: Vec<_> = seq.iter().collect();
        let second: Vec<_> = (&seq).into_iter().collect();
        assert_eq!(first, vec![0, 10, 20, 30]);
        assert_eq!(first, second);
    }

    #[test]
    fn passes_are_independent() {
        let seq = Restartable::new(|| vec!['a', 'b', 'c']);
        let mut a = seq.iter();
        let mut b = seq.iter();
        assert_eq!(a.next(), Some('a'));
        assert_eq!(a.next(), Some('b'));
        assert_eq!(b.next(), Some('a'));
    }

    #[test]
    fn factory_runs_once_per_pass() {
        let calls = Cell::new(0);
        let seq = Restartable::new(|| {
            calls.set(calls.get() + 1);
            std::iter::once(calls.get())
        });
        let mut total = 0;
        for x in &seq {
            total += x;
        }
        for x in &seq {
            total += x;
        }
        assert_eq!(calls.get(), 2);
        assert_eq!(total, 3);
    }
}
