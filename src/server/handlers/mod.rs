//! RX event loop and packet/event handlers.

mod dispatch;
mod relay;
mod rx_loop;
mod timeout;
