pub mod alert;
pub mod task;
pub mod timeframe;

pub use alert::*;
pub use task::*;
pub use timeframe::*;
