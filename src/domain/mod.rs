pub mod booking;
pub mod phone;
pub mod retry;
pub mod template;
