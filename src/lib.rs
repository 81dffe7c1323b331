//! MEEN — a cycle-accurate Intel 8080 machine emulator engine.
//!
//! The engine is embeddable: a client supplies two pluggable peripherals — a
//! memory controller and an i/o controller — then drives the machine with
//! [`Machine::run`] and observes effects through those controllers and the
//! save/load state callbacks.
//!
//! ```no_run
//! use meen::{Machine, Controller};
//!
//! # fn controllers() -> (Box<dyn Controller>, Box<dyn Controller>) { unimplemented!() }
//! let (memory, io) = controllers();
//! let mut machine = Machine::new();
//! machine.attach_memory_controller(memory)?;
//! machine.attach_io_controller(io)?;
//! machine.set_options(Some(r#"json://{"clockSamplingFreq":40,"isrFreq":60}"#))?;
//! machine.run()?;
//! let emulated_ns = machine.wait_for_completion()?;
//! # Ok::<(), meen::Error>(())
//! ```
//!
//! # Options
//!
//! | key | default | effect |
//! |---|---|---|
//! | `clockSamplingFreq` | -1 | Hz at which emulated time syncs to wall time; -1 = no pacing, 0 = every tick |
//! | `isrFreq` | 0 | interrupt poll cadence in sampling periods; 0 = every instruction |
//! | `runAsync` | false | `run` returns immediately, the loop executes on a worker thread |
//! | `saveAsync` | false | the save handler runs on a worker thread |
//! | `loadAsync` | false | the load handler runs on a worker thread |
//! | `encoder` | "base64" | binary-to-text codec for snapshot payloads |
//! | `compressor` | "zlib" | byte compressor for snapshot ram |
//!
//! # Snapshots
//!
//! The save handler receives (and the load handler returns) a JSON document:
//!
//! ```json
//! {
//!   "cpu": { "uuid": "base64://<16B>", "registers": { "a":0, "...": 0, "s":2 },
//!            "pc": 0, "sp": 0 },
//!   "memory": {
//!     "uuid": "base64://<memory controller uuid>",
//!     "rom":  { "bytes": "base64://md5://<digest>" },
//!     "ram":  { "size": 65530, "bytes": "base64://zlib://<payload>" }
//!   }
//! }
//! ```
//!
//! Rom `bytes` values accept `base64://<payload>`, `base64://zlib://<payload>`,
//! `base64://md5://<digest>` (identity check only) and `file://<path>`.

mod clock;
mod controller;
mod cpu;
mod error;
mod machine;
mod opts;
mod transcode;

pub use controller::{Controller, Isr};
pub use error::Error;
pub use machine::Machine;
// Controller identities are uuid values; re-export the type for implementors.
pub use uuid::Uuid;
