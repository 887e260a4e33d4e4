//! # Tessera Testing
//!
//! Test utilities for the Tessera orchestrator.
//!
//! ## Components
//!
//! - **Mock Handlers**: scriptable capability handlers with latency, failures,
//!   health toggles and a concurrency probe
//! - **Test Harness**: an orchestrator preloaded with mocks that records whole
//!   event streams
//! - **Assertions**: ordering checks over plan event streams
//!
//! ## Usage
//!
//! ```rust
//! use tessera_core::{Plan, Step};
//! use tessera_testing::{MockHandler, TestHarness, assert_well_ordered};
//!
//! # tokio_test::block_on(async {
//! let search = MockHandler::new();
//! let harness = TestHarness::builder()
//!     .handler("search", search.clone())
//!     .build()
//!     .unwrap();
//!
//! let plan = Plan::builder()
//!     .step(Step::builder("lookup", "search"))
//!     .build()
//!     .unwrap();
//! let run = harness.run(plan).await.unwrap();
//!
//! assert!(run.outcome.is_success());
//! assert_well_ordered(&run.events);
//! assert_eq!(search.call_count(), 1);
//! # });
//! ```

/// Event stream assertions
pub mod assertions;
/// Orchestrator harness over mock handlers
pub mod harness;
/// Mock capability handlers
pub mod mock_handlers;

pub use assertions::{assert_well_ordered, count_by_name, phase_layout};
pub use harness::{RunRecord, TestHarness, TestHarnessBuilder};
pub use mock_handlers::{ConcurrencyProbe, MockCall, MockHandler};
