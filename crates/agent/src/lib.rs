//! Generation runtime - the reply-producing half of the reservo engine.
//!
//! Given a user's message and the session history, this crate:
//! 1. **Completion** (`llm`) - submits the history plus the declared tool
//!    schema to the chat model.
//! 2. **Authorization** (`generation`) - routes every model-requested tool
//!    call through the policy gate before anything executes; a failing or
//!    timed-out gate fails open with a tagged degraded allow.
//! 3. **Tool Execution** (`tools`) - invokes the scheduling collaborator and
//!    normalizes its result or error into a tool outcome the model can read.
//! 4. **Re-prompt** - feeds the tool outcome back and loops, bounded by a
//!    hard round cap, until the model returns plain text.
//!
//! The model never executes anything itself: every side effect passes through
//! the policy gate and the tool executor.

pub mod generation;
pub mod llm;
pub mod tools;

pub use generation::{GenerationEngine, GenerationError, GenerationOutcome, GenerationRequest};
pub use llm::{
    ChatMessage, ChatModel, ChatRole, LlmError, ModelOutput, ModelResponse, OpenAiChatModel,
    ToolCall, ToolSpec,
};
pub use tools::{
    HttpSchedulingClient, SchedulingClient, SchedulingError, ToolErrorKind, ToolExecutor,
    ToolOutcome,
};
