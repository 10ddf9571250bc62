pub mod expo;
pub mod intent;
pub mod member;
pub mod payment;
pub mod qr_code;
pub mod reservation;
pub mod ticket;
