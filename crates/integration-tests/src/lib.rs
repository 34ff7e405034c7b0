//! Shared registration machinery for qrun integration tests.
//!
//! Tests register themselves with [`integration_test!`] into a linker-collected
//! slice, which the test binary turns into libtest-mimic trials.

use linkme::distributed_slice;

/// Signature of a registered test.
pub type TestFn = fn() -> color_eyre::Result<()>;

#[derive(Debug)]
pub struct IntegrationTest {
    pub name: &'static str,
    pub f: TestFn,
}

impl IntegrationTest {
    pub const fn new(name: &'static str, f: TestFn) -> Self {
        Self { name, f }
    }
}

/// All tests registered with [`integration_test!`].
#[distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// Register a `fn() -> Result<()>` as an integration test.
#[macro_export]
macro_rules! integration_test {
    ($fn_name:ident) => {
        #[allow(non_snake_case)]
        mod $fn_name {
            #[::linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            static TEST: $crate::IntegrationTest =
                $crate::IntegrationTest::new(stringify!($fn_name), super::$fn_name);
        }
    };
}
