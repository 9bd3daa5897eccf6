/// Max length of a user id (client or provider).
pub const MAX_PARTY_ID_LEN: usize = 128;

/// Max number of free-form descriptive fields on one booking.
pub const MAX_DETAIL_FIELDS: usize = 32;

/// Max length of a descriptive field name.
pub const MAX_DETAIL_KEY_LEN: usize = 64;

/// Max length of a descriptive field value (avatar URLs included).
pub const MAX_DETAIL_VALUE_LEN: usize = 2048;

/// Max live bookings held by one store.
pub const MAX_LIVE_BOOKINGS: usize = 1_000_000;

/// Max events staged by a single transaction.
pub const MAX_TXN_WRITES: usize = 16;

/// Default attempt budget of the transaction runner.
pub const DEFAULT_TXN_ATTEMPTS: u32 = 5;

/// Valid rating range, inclusive.
pub const MIN_STARS: u8 = 1;
pub const MAX_STARS: u8 = 5;
