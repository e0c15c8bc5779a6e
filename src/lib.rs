//! callgraph-prof - call-stack profiling engine
//!
//! Consumes per-thread call-enter/call-exit events, timestamps them with a
//! pluggable clock and aggregates a caller/callee call graph per thread:
//! self, total, wait and children time plus call counts for every method and
//! every caller→callee edge, with recursion folded into one record per
//! method.
//!
//! ```
//! use callgraph_prof::config::ProfilerConfig;
//! use callgraph_prof::registry::Qualifier;
//! use callgraph_prof::session::Profiler;
//!
//! let profiler = Profiler::new(ProfilerConfig::wall()).unwrap();
//! let ((), snapshot) = profiler
//!     .profile(|| {
//!         let _guard = profiler.scope(&Qualifier::Class("Parser".into()), "parse");
//!     })
//!     .unwrap();
//! assert!(snapshot.result().is_some());
//! ```

pub mod call_graph;
pub mod call_stack;
pub mod cli;
pub mod config;
pub mod error;
pub mod measure;
pub mod registry;
pub mod replay;
pub mod result;
pub mod session;

pub use error::{ProfileError, Result};
pub use measure::{CountingAllocator, MeasureMode};
pub use registry::{MethodId, Qualifier, SourceLocation};
pub use result::{CallInfo, MethodInfo, ProfileResult, ThreadProfile};
pub use session::{Profiler, Snapshot, ThreadKey};
