pub mod offers;
pub mod session;
