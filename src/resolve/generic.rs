use crate::{EvalContext, EvalFlags, VfsError};

use super::{is_current_directory, is_parent_directory};

/// Result of evaluating one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalStatus {
    /// The token was consumed; go on with the next one.
    Continue,
    /// The evaluation of this instance is over, successfully or not.
    Done,
    /// The token does not exist in the current directory. It is left in the
    /// context.
    NoEntry,
}

/// What a backend provides to be walked by [`eval_path_generic`].
pub trait GenericEval {
    fn is_directory(&self, ctx: &EvalContext<'_>) -> bool;

    /// Looks `token` up in the current directory and moves the current
    /// location onto it. `.` and `..` arrive here only when they stay inside
    /// the instance.
    fn eval_token(&self, ctx: &mut EvalContext<'_>, token: &str) -> EvalStatus;
}

/// Walks the remaining path token by token.
///
/// `.` and `..` are handled here: `..` never leaves the evaluation root, and
/// at the root of a mounted instance it continues in the covered directory
/// of the parent instance.
pub fn eval_path_generic<G: GenericEval + ?Sized>(ctx: &mut EvalContext<'_>, config: &G) {
    let mut status = EvalStatus::Continue;
    while status == EvalStatus::Continue {
        ctx.next_token();
        let (buf, range) = ctx.token_source();
        let token = &buf[range];
        if token.is_empty() {
            break;
        }
        if !config.is_directory(ctx) {
            ctx.error(VfsError::NotADirectory);
            break;
        }

        status = if is_current_directory(token) {
            if ctx.has_path() || !ctx.flags().contains(EvalFlags::REJECT_TERMINAL_DOT) {
                config.eval_token(ctx, token)
            } else {
                ctx.error(VfsError::InvalidArgument);
                EvalStatus::Done
            }
        } else if is_parent_directory(token) {
            eval_parent(ctx, config)
        } else {
            config.eval_token(ctx, token)
        };

        if status == EvalStatus::NoEntry && ctx.has_path() {
            ctx.eat_delimiter();
            if !ctx.flags().contains(EvalFlags::ACCEPT_RESIDUAL_DELIMITERS) || ctx.has_path() {
                ctx.error(VfsError::NoEntry);
            }
        }
    }
}

fn eval_parent<G: GenericEval + ?Sized>(ctx: &mut EvalContext<'_>, config: &G) -> EvalStatus {
    if ctx.is_eval_root() {
        return config.eval_token(ctx, ".");
    }
    if ctx.currentloc().is_instance_root() {
        let mount = ctx.currentloc().mount().clone();
        if mount.has_mount_point() {
            ctx.put_back_token();
            ctx.restart(mount.mount_point_slot());
            return EvalStatus::Done;
        }
        return config.eval_token(ctx, ".");
    }
    config.eval_token(ctx, "..")
}
