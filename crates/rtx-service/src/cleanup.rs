//! Ordered cleanup steps that run on every exit path.

/// A list of cleanup steps run in the order they were added.
///
/// Steps still pending when the chain is dropped run then, so an early
/// return or a panic between [`then`](Self::then) and [`run`](Self::run)
/// does not skip them.
#[derive(Default)]
pub struct CleanupChain<'a> {
    steps: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> CleanupChain<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn then(mut self, step: impl FnOnce() + 'a) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step now.
    pub fn run(self) {}
}

impl Drop for CleanupChain<'_> {
    fn drop(&mut self) {
        for step in self.steps.drain(..) {
            step();
        }
    }
}
