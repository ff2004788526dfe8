use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, IResult};
use crate::wal::reader::Reporter;

/// A `Reporter` that remembers the first corruption seen so recovery can
/// decide between skipping the damaged tail and aborting.
#[derive(Clone, Default)]
pub struct LogReporter {
    inner: Rc<RefCell<Option<String>>>,
}

impl LogReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result(&self) -> IResult<()> {
        match self.inner.borrow().as_ref() {
            Some(reason) => Err(Error::Corruption(reason.clone())),
            None => Ok(()),
        }
    }
}

impl Reporter for LogReporter {
    fn corruption(&mut self, bytes: u64, reason: &str) {
        let mut slot = self.inner.borrow_mut();
        if slot.is_none() {
            *slot = Some(format!("{} ({} bytes dropped)", reason, bytes));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_first_corruption() {
        let reporter = LogReporter::new();
        assert!(reporter.result().is_ok());
        let mut r = reporter.clone();
        r.corruption(7, "checksum mismatch");
        r.corruption(3, "later noise");
        let err = reporter.result().unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }
}
