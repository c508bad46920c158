pub mod booking;
pub mod space;
pub mod webhook;

pub use booking::{
    Booking, BookingPatch, BookingStatus, CaptureMethod, ClientContact, PaymentAuthorization,
    PaymentStatus, PendingAction,
};
pub use space::{DepositPolicy, Space};
pub use webhook::{DeadLetter, GatewayEvent, GatewayEventKind};
