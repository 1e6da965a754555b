//! # rcl-core
//!
//! An inference-time reliability controller. It wraps a text generator and
//! decides, per request, whether to emit the answer, revise it, verify it
//! against evidence, or abstain, under explicit risk and cost budgets.
//!
//! ## Core Components
//!
//! - **Monitor**: sample agreement, entropy slope, contradiction mass and
//!   retrieval coverage from K candidates ([`monitor`], [`claims`])
//! - **Evaluate**: judge, process-reward and citation scores ([`evaluate`])
//! - **Control**: constrained-MDP policy over emit/revise/verify/abstain ([`control`])
//! - **Learn**: dual ascent and conformal threshold from labelled outcomes ([`calibrate`])
//! - **Audit**: hash-chained decision log ([`audit`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rcl_core::adapters::fixed::StaticGenerator;
//! use rcl_core::{Pipeline, Request};
//!
//! let pipeline = Pipeline::builder(Arc::new(StaticGenerator::new(["Paris."])))
//!     .build()?;
//! let response = pipeline.run(&Request::new("Capital of France?")).await?;
//! if response.is_emit() {
//!     println!("{}", response.text.unwrap_or_default());
//! }
//! ```

pub mod adapters;
pub mod audit;
pub mod calibrate;
pub mod claims;
pub mod config;
pub mod control;
pub mod error;
pub mod evaluate;
pub mod llm;
pub mod monitor;
pub mod pipeline;
pub mod request;
pub mod selector;
pub mod text;
pub mod trajectory;

#[cfg(test)]
mod properties;
#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use adapters::{
    Candidate, Entailment, EntailmentAdapter, EntailmentLabel, GenerationPrompt, Generator,
    RetrievalAdapter, Scorer, SpanCoverage,
};
#[cfg(feature = "sqlite")]
pub use audit::SqliteSink;
pub use audit::{
    load_and_verify, verify_chain, AuditHandle, AuditLogger, AuditStats, CostReport,
    JsonlFileSink, LogRecord, LogSink, MemorySink,
};
pub use calibrate::{
    CalibrationHandle, CalibrationService, CalibrationStats, Calibrator, CalibratorCheckpoint,
    DualState, DualStateReader, Outcome,
};
pub use claims::{Claim, ClaimExtractor, ClaimGraph, ClaimGraphBuilder};
pub use config::{
    AuditConfig, CalibrationConfig, ControlConfig, ControllerConfig, GraphConfig, SelectorConfig,
    SignalConfig,
};
pub use control::{Action, Decision, DecisionController, DecisionRule};
pub use error::{Error, Result};
pub use evaluate::{Evaluator, Scores};
pub use llm::{CompletionRequest, CompletionResponse, LLMClient};
pub use monitor::{SignalExtractor, Signals};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use request::{Budget, EvidenceBundle, EvidenceSpan, FinalAction, Request, Response, Route};
pub use selector::{DynamicKSelector, KSelection};
pub use trajectory::{
    BroadcastEmitter, CollectingEmitter, NullEmitter, TrajectoryEmitter, TrajectoryEvent,
    TrajectoryEventType,
};
