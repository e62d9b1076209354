//! Speculative block execution for a blockchain validator.
//!
//! The crate turns ordered batches of proposed transactions into
//! deterministic state changes, and does so as early and as concurrently as
//! it safely can:
//!
//! - **Speculation**: a proposal is executed in the background as soon as it
//!   arrives ([`SpeculationController`]); the confirming call reuses the
//!   result when the decided block matches and redoes it otherwise.
//! - **Dependency scheduling**: transactions declare the resources they
//!   read and write; the [`Dag`] built from those declarations tells the fast
//!   executor which transactions must wait for which.
//! - **Path fallback**: each batch runs on the fast, OCC or sequential
//!   executor ([`ExecutionPathSelector`]); an abort on the fast path redoes
//!   the whole batch on the next safer path.
//! - **Pipelining**: [`BlockPipeline`] overlaps parallel preprocessing,
//!   strictly ordered execution and receipt writing across heights.
//!
//! # Quick Start
//!
//! ```
//! use speculative_exec::{
//!     Application, BlockHeader, BlockProcessor, ExecutionConfig, HandlerRegistry, MemReceiptStore, MemStore,
//!     StandardHooks, TransferVm,
//! };
//! use std::sync::Arc;
//!
//! let processor = BlockProcessor::new(
//!     ExecutionConfig::minimal(),
//!     Arc::new(HandlerRegistry::standard()),
//!     Arc::new(TransferVm),
//!     Arc::new(StandardHooks::new()),
//! )
//! .unwrap();
//! let app = Application::new(processor, Arc::new(MemStore::new()), Arc::new(MemReceiptStore::new()));
//!
//! let header = BlockHeader { height: 1, ..BlockHeader::default() };
//! app.process_proposal(&header, &[]);
//! let response = app.finalize_block(&header, &[]).unwrap();
//! let commit = app.commit().unwrap();
//! assert_eq!(commit.app_hash, response.app_hash);
//! ```

pub mod app;
pub mod apply;
pub mod codec;
pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod hooks;
pub mod keys;
#[cfg(feature = "loadgen")]
pub mod loadgen;
pub mod pipeline;
pub mod preprocess;
pub mod processor;
pub mod receipts;
pub mod recovery;
pub mod speculation;
pub mod state;
pub mod types;
pub mod vm;
#[cfg(feature = "revm")]
pub mod vm_revm;

pub use app::{Application, CommitResponse, FinalizeBlockResponse, ProposalSource, ProposalStatus, TxAction, TxRecord};
pub use config::ExecutionConfig;
pub use dag::{Dag, DependencyGraphBuilder};
pub use error::{AppError, BlockError, DagError, PipelineError};
pub use executor::{ExecutionPath, ExecutionPathSelector};
pub use handlers::HandlerRegistry;
pub use hooks::{BlockHooks, StandardHooks};
pub use pipeline::{BlockInput, BlockPipeline, ExecutedBlock};
pub use processor::{BlockProcessor, ProcessedBlock};
pub use receipts::{MemReceiptStore, Receipt, ReceiptStore};
pub use recovery::SenderRecoveryPool;
pub use speculation::SpeculationController;
pub use state::{MemStore, StateStore};
pub use types::{BlockContext, BlockHeader, TxResult};
pub use vm::{TransferVm, VirtualMachine};
