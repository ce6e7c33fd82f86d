//! In-kernel test framework.
//!
//! There is no hosted test runner in a freestanding kernel, so tests are
//! plain functions returning [`TestResult`], grouped into suites with
//! [`define_test_suite!`] and driven by the kernel's diagnostics path. The
//! assertion macros bail out of the enclosing test with `Fail` instead of
//! panicking.

mod assertions;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    Skipped,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass | Self::Skipped)
    }
}

/// Outcome of one suite run.
#[derive(Clone, Copy, Debug)]
pub struct TestSuiteResult {
    pub name: &'static str,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

/// Run one test and log its outcome.
pub fn run_single_test(name: &str, test: impl FnOnce() -> TestResult) -> TestResult {
    let result = test();
    match result {
        TestResult::Pass => crate::klog_debug!("test {}: ok", name),
        TestResult::Fail => crate::klog_info!("test {}: FAILED", name),
        TestResult::Skipped => crate::klog_debug!("test {}: skipped", name),
    }
    result
}

/// Log a suite summary line.
pub fn report_suite(result: &TestSuiteResult) {
    if result.failed == 0 {
        crate::klog_info!("suite {}: {}/{} passed", result.name, result.passed, result.total);
    } else {
        crate::klog_info!(
            "suite {}: {}/{} passed, {} FAILED",
            result.name,
            result.passed,
            result.total,
            result.failed
        );
    }
}

#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::klog_info!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::klog_info!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

#[macro_export]
macro_rules! run_test {
    ($passed:expr, $total:expr, $test_fn:path) => {{
        $total += 1;
        let result = $crate::testing::run_single_test(stringify!($test_fn), || $test_fn());
        if result.is_pass() {
            $passed += 1;
        }
    }};
}

/// Define `run_<name>_suite()` running the listed tests in order.
#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:path),* $(,)?]) => {
        $crate::paste::paste! {
            /// Run every test in this suite and log a summary.
            pub fn [<run_ $suite_name _suite>]() -> $crate::testing::TestSuiteResult {
                let mut passed = 0u32;
                let mut total = 0u32;

                $(
                    $crate::run_test!(passed, total, $test_fn);
                )*

                let result = $crate::testing::TestSuiteResult {
                    name: stringify!($suite_name),
                    total,
                    passed,
                    failed: total - passed,
                };
                $crate::testing::report_suite(&result);
                result
            }
        }
    };
}
