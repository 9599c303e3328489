//! # Observatory
//!
//! An autonomous observatory orchestration engine. It works through a night
//! of observation tickets, driving the camera, telescope mount, dome,
//! focuser, guider, tertiary mirror and flat lamp, and keeps going through
//! weather, vendor software crashes and unreachable targets.
//!
//! ## Features
//!
//! - **Per-device actors**: every device is owned by one thread that runs
//!   commands in submission order
//! - **Watchdog**: liveness polling and telescope position validation
//! - **Scheduler**: slew, focus, expose, calibrate and shut down per ticket
//! - **Crash recovery**: restart table with per-device obligations
//! - **Satellite tracking**: three streak and follow modes
//! - **Simulation**: scripted drivers on a virtual clock for rehearsals and tests
//!
//! ## Quick Start
//!
//! ```no_run
//! use observatory::sim::SimWorld;
//! use observatory::{parse_tickets, ObservatoryConfig, RunOptions, Scheduler};
//!
//! let tickets = parse_tickets(r#"{
//!     "name": "M13", "ra": 16.69, "dec": 36.46,
//!     "start_time": "2024-03-01T02:00:00+00:00",
//!     "end_time": "2024-03-01T03:00:00+00:00",
//!     "filter": "v", "exp_time": 30.0, "num": 5
//! }"#).unwrap();
//! let world = SimWorld::new(tickets[0].start_utc());
//! let mut scheduler = Scheduler::new(
//!     tickets,
//!     ObservatoryConfig::default(),
//!     RunOptions::new("images"),
//!     world.environment(),
//! ).unwrap();
//! let report = scheduler.observe().unwrap();
//! println!("{:?}", report.ending);
//! ```
//!
//! ## Architecture
//!
//! - [`actor`] - Device actor threads and their control surface
//! - [`devices`] - Typed device handles and the vendor driver traits
//! - [`observatory`] - The set of running actors
//! - [`watchdog`] - Crash and coordinate monitoring
//! - [`scheduler`] - The observation run
//! - [`sim`] - Simulated site

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod actor;
pub mod astrometry;
pub mod clock;
pub mod conditions;
pub mod config;
pub mod devices;
pub mod images;
pub mod observatory;
pub mod restarts;
pub mod safety;
pub mod satellite;
pub mod scheduler;
pub mod signal;
pub mod sim;
pub mod ticket;
pub mod watchdog;

// Re-export main public types for convenience
pub use config::ObservatoryConfig;
pub use scheduler::{Environment, RunEnding, RunError, RunOptions, RunReport, Scheduler};
pub use ticket::{load_tickets, parse_tickets, Ticket};
