pub use tracing::{debug, debug_span, error, info, info_span, instrument, trace, warn};
