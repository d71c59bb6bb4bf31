// Hard caps on input sizes and per-tenant state. Requests exceeding these are
// rejected with `LimitExceeded` before anything touches the WAL.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_SHOPS_PER_TENANT: usize = 10_000;
pub const MAX_CLIENTS_PER_SHOP: usize = 100_000;
pub const MAX_APPOINTMENTS_PER_SHOP: usize = 500_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_PRINCIPAL_LEN: usize = 128;

/// Widest date window a single range query may cover, inclusive of both ends.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 400;
