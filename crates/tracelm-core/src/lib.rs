pub mod bundle;
pub mod error;
pub mod feedback;
pub mod graph;
pub mod id;
pub mod node;
pub mod propagate;

// Re-export commonly used types
pub use bundle::{concat_as_text, numbered_lines, Bundle, OpContext, TrainableBundle};
pub use error::{BundleError, CoreError, ExecutionFailure, OpError};
pub use feedback::{ConcatAggregator, Feedback, FeedbackAggregator, FeedbackEntry, FeedbackMap};
pub use graph::{contain, TraceGraph};
pub use id::{NodeId, OpCallId};
pub use node::{value_text, Node, NodeKind, Producer, Value};
pub use propagate::{backward, BackwardOptions, BackwardReport, PropagationResult};
