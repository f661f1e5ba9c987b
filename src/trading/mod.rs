// src/trading/mod.rs
pub mod dispatcher;
pub mod fsm;
pub mod manager;
pub mod router;

pub use dispatcher::{AccountOrderResult, DispatchReport, OrderDispatcher};
pub use fsm::{FsmSnapshot, FsmState, InstrumentStateMachine, PositionEvent};
pub use manager::{PersistenceTask, StateMachineManager};
pub use router::LiveOrderRouter;
