/// HTTP handlers
mod admins;
mod events;

pub use admins::{create_admin, delete_admin, get_admin, list_admins, update_admin};
pub use events::{
    change_status, create_event, delete_event, get_event, list_events, update_event,
};
