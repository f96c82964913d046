use std::cell::Cell;

/// Sets a re-entrancy flag for the lifetime of the guard.
///
/// The previous value is put back on drop, so early returns through `?` and nested guards on
/// the same flag both leave it exactly as they found it.
#[must_use = "the flag is reset as soon as the guard is dropped"]
pub struct ScopedFlag<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> ScopedFlag<'a> {
    pub fn raise(flag: &'a Cell<bool>) -> Self {
        let previous = flag.replace(true);
        Self { flag, previous }
    }
}

impl Drop for ScopedFlag<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restores_previous_value_on_drop() {
        let flag = Cell::new(false);
        {
            let _outer = ScopedFlag::raise(&flag);
            assert!(flag.get());
            {
                let _inner = ScopedFlag::raise(&flag);
                assert!(flag.get());
            }
            // Inner guard restores the value the outer guard set, not `false`.
            assert!(flag.get());
        }
        assert!(!flag.get());
    }

    #[test]
    fn resets_on_early_error_return() {
        fn step() -> Result<(), &'static str> {
            Err("boom")
        }

        fn fails(flag: &Cell<bool>) -> Result<(), &'static str> {
            let _guard = ScopedFlag::raise(flag);
            step()?;
            Ok(())
        }

        let flag = Cell::new(false);
        assert!(fails(&flag).is_err());
        assert!(!flag.get());
    }
}
