//! Integration test harness for dendrite.
//!
//! The end-to-end scenarios in `tests/` drive the runtime through
//! hand-written parts implementing the instance/population protocols,
//! which pins the contract generated code compiles against. Pipeline
//! tests run Parse -> Digest -> Emit and check the produced source.
