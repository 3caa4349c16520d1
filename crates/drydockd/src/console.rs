//! Where command output goes: this terminal, or back over the control
//! socket to the operator that asked for it.

use tokio::sync::mpsc;

#[derive(Clone)]
pub enum Console {
    Stdout,
    Remote(mpsc::UnboundedSender<String>),
}

impl Console {
    pub fn line(&self, text: impl Into<String>) {
        match self {
            Console::Stdout => println!("{}", text.into()),
            // The client hung up; the operation itself carries on.
            Console::Remote(tx) => {
                let _ = tx.send(text.into());
            }
        }
    }
}
