pub mod block;
pub mod chunk;
pub mod coords;
pub mod entity;
pub mod physics;
pub mod protocol;
