pub mod ask;
pub mod chat;
pub mod tools;

mod render;
mod runtime;
mod turn;
