//! Internal testing utilities for the gearshift crates.

use std::any::Any;
use std::fmt::Debug;
use std::panic::RefUnwindSafe;

/// Table-driven test runner.
///
/// Create a `Debug` struct, conventionally named `Case`, holding the inputs
/// and expected outputs of one case, build a collection of cases and call
/// [`test_each`](TestCases::test_each) with the test body:
///
/// ```
/// use gearshift_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///     spec: &'static str,
///     unknown: usize,
/// }
///
/// let cases = [
///     Case { spec: "-1,3", unknown: 1 },
///     Case { spec: "-1,-1", unknown: 2 },
/// ];
///
/// cases.test_each(|case| {
///     let count = case.spec.split(',').filter(|d| *d == "-1").count();
///     assert_eq!(count, case.unknown);
/// });
/// ```
///
/// Every case is run even if an earlier one panics. If any case failed, the
/// runner panics with the number of failures, the debug representation of
/// each failing case and its panic message.
///
/// The test closure must be unwind safe. Values with interior mutability
/// (eg. a graph under construction) should be created inside the closure
/// rather than captured.
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Run `test` with a reference to each case, catching panics.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Variant of [`test_each`](TestCases::test_each) which passes cases by
    /// value.
    ///
    /// The debug representation of each case is captured before the test
    /// runs, so owned cases don't need to outlive the test closure.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + std::panic::UnwindSafe;
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            if let Err(payload) = std::panic::catch_unwind(|| test(&case)) {
                failures.push(format!("{:?}: {}", case, panic_message(&*payload)));
            }
        }
        report_failures(&failures);
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + std::panic::UnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            let case_str = format!("{:?}", case);
            let test = &test;
            if let Err(payload) = std::panic::catch_unwind(move || test(case)) {
                failures.push(format!("{}: {}", case_str, panic_message(&*payload)));
            }
        }
        report_failures(&failures);
    }
}

fn report_failures(failures: &[String]) {
    assert!(
        failures.is_empty(),
        "{} test cases failed:\n{}",
        failures.len(),
        failures.join("\n")
    );
}

/// Extract the message from a panic payload, if it is a string.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic>"
    }
}
