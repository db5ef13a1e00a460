//! Remote control for a four-motor Pybricks hub.
//!
//! [`controller`] owns the link: discovery, session, program upload and
//! command dispatch on a background thread. [`domain`] holds the command
//! alphabet, settings and errors; [`infrastructure`] the transports and
//! logging; [`presentation`] a terminal front end.

pub mod controller;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
