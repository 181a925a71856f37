//! Trigger module - procedures and the dispatcher that fires them

mod dispatcher;

pub use dispatcher::{TriggerContext, TriggerDispatcher, TriggerProcedure, MAX_TRIGGER_DEPTH};
