//! Package installers that run inside an active sandbox.

pub mod conda;

pub use conda::CondaInstall;

use anyhow::Result;

use crate::term::ConsoleSpinner;

/// Where installers ask the user questions, such as licence acceptance.
pub trait InputSource {
    fn read_input(&self, prompt: &str) -> Result<String>;
}

impl InputSource for ConsoleSpinner {
    fn read_input(&self, prompt: &str) -> Result<String> {
        ConsoleSpinner::read_input(self, prompt)
    }
}
