//! Generated gRPC contracts (spec §6): upstream raw-ledger subscription,
//! downstream domain-event subscription, and control-plane `Register`/
//! `Heartbeat`. Message and service definitions live in `proto/stage.proto`;
//! `build.rs` compiles them with `tonic-build` at build time.

tonic::include_proto!("stage.v1");
