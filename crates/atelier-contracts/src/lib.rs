pub mod events;
pub mod outcome;
pub mod quota;
pub mod request;
pub mod runs;
pub mod scenes;
