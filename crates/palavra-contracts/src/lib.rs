pub mod cards;
pub mod daily;
pub mod events;
pub mod fallback;
pub mod gallery;
