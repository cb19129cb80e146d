/// Reservations still holding a resource. Cancelled and completed history does not count.
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 200_000;

pub const MAX_RESOURCES: usize = 64;

pub const MAX_NAME_LEN: usize = 256;

pub const MAX_NOTES_LEN: usize = 2_000;

/// Payer, booker and external ids.
pub const MAX_ID_LEN: usize = 128;

/// Widest range accepted by listing queries.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;

/// Days rendered by a weekly grid.
pub const GRID_DAYS: u64 = 7;

/// Entries the external event cache will hold before refusing upserts.
pub const MAX_CACHED_EVENTS: usize = 50_000;

/// Longest accepted wire request line in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
