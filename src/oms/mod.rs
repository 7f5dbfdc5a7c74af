// =============================================================================
// Order Management — order and position lifecycle, P&L, protective exits
// =============================================================================

mod orders;
mod positions;
pub mod watcher;

pub use orders::{Fill, NewOrder, Order, OrderStore};
pub use positions::{
    ExitReason, ExitTrigger, FillApplication, FillIntent, Lot, Position, PositionBook,
};
