pub mod bearer_token;
pub mod device_registration;
pub mod job_execution;
pub mod security_event;
pub mod token_pairing;
pub mod user;

pub use bearer_token::Entity as BearerToken;
pub use device_registration::Entity as DeviceRegistration;
pub use job_execution::Entity as JobExecution;
pub use security_event::Entity as SecurityEvent;
pub use token_pairing::Entity as TokenPairing;
pub use user::Entity as User;
