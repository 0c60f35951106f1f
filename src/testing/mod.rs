//! Testing support
//!
//! Provides:
//! - Test data generators
//! - Fake market sources with scripted outcomes and gates

pub mod fakes;
pub mod generators;

pub use fakes::{GatedSource, ScriptedSource, StaticSource};
pub use generators::TestDataGenerator;
