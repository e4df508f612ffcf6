mod booking;
mod change;
mod counter_offer;
mod location;
mod offer;
mod profile;
mod response;

pub use booking::{Booking, BookingStatus};
pub use change::{diff, Change, ChangeStream};
pub use counter_offer::{
    counter_bounds, is_valid_counter, validate_counter, CounterDefaults, CounterOffer,
    CounterOfferStatus, NewCounterOffer, Proposer,
};
pub use location::{haversine_km, Coordinates, DriverLocation};
pub use offer::{Offer, OfferRow, OfferStatus, Rider, Stop};
pub use profile::RiderProfile;
pub use response::{eta_minutes, DriverResponse, ResponseKind};
