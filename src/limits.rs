// Hard input limits. Enforced at the catalog/engine boundary so a single
// client cannot grow the WAL without bound.

use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_EMAIL_LEN: usize = 512;
pub const MAX_DESCRIPTION_LEN: usize = 512;
pub const MAX_COMMENT_LEN: usize = 2048;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 1000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
