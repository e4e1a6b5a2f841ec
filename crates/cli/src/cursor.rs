use roost_stream::CursorCodec;
use roost_types::MessageId;

use crate::Context;

/// Seal a message id with the configured secret.
#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct SealCommand {
    pub id: MessageId,
}

/// Recover the message id behind a cursor.
#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct UnsealCommand {
    pub cursor: String,
}

fn codec(ctx: &Context) -> Result<CursorCodec, String> {
    CursorCodec::new(ctx.config.server.cursor_secret.as_bytes()).map_err(|e| e.to_string())
}

impl SealCommand {
    pub fn execute(&self, ctx: &Context) -> Result<(), String> {
        println!("{}", codec(ctx)?.seal(self.id));
        Ok(())
    }
}

impl UnsealCommand {
    pub fn execute(&self, ctx: &Context) -> Result<(), String> {
        let id = codec(ctx)?
            .unseal(self.cursor.trim())
            .map_err(|e| format!("Invalid cursor: {}", e))?;
        println!("{}", id);
        Ok(())
    }
}
