//! Operations against a native backend.

use std::sync::Arc;

use dbx_protocol::{Argument, Command, OwnedArgument};

use crate::connection::{Link, Session};
use crate::driver::status::isc;
use crate::driver::{split_function_name, Backend, DbType, Direction, ObjectValue, TransactionModel};
use crate::error::{DbxError, DbxResult};
use crate::request::{Reply, Request};
use crate::transaction::{Job, Transactions};

/// Increments this long or longer are taken as 1
const MAX_INCREMENT_LEN: usize = 32;

/// Longest namespace `setnamespace` accepts
const MAX_NAMESPACE_LEN: usize = 64;

/// Route `request` through the connection's link.
pub fn perform(db_type: DbType, session: &mut Session, request: &Request<'_>) -> DbxResult<Reply> {
    let command = request.command;
    if db_type.is_m_only() {
        if command.is_object_operation() {
            return Err(DbxError::objects_not_available());
        }
        if matches!(command, Command::GetNamespace | Command::SetNamespace) {
            return Err(DbxError::namespaces_not_available());
        }
    }

    let Session { link, transactions } = session;
    match link {
        Link::Native(backend) => native(backend, transactions, request),
        Link::Network(client) => client.command(request.raw),
        Link::Gateway(client) => client.command(command, &request.args),
        Link::Closed => Err(DbxError::NoConnection),
    }
}

fn native(
    backend: &Arc<dyn Backend>,
    transactions: &mut Transactions,
    request: &Request<'_>,
) -> DbxResult<Reply> {
    let threaded = backend.transaction_model() == TransactionModel::Threaded;
    match request.command {
        Command::TStart if threaded => {
            transactions.start(backend)?;
            Ok(Reply::ok())
        }
        Command::TLevel if threaded => Ok(Reply::text(transactions.depth().to_string())),
        Command::TCommit if threaded => {
            transactions.commit()?;
            Ok(Reply::ok())
        }
        Command::TRollback if threaded => {
            transactions.rollback()?;
            Ok(Reply::ok())
        }
        command if transactions.is_active() => transactions.execute(job(command, &request.args)),
        command => execute(backend.as_ref(), command, &request.args),
    }
}

/// Package an operation for the transaction thread. The arguments borrow
/// the caller's input, so they are copied first.
fn job(command: Command, args: &[Argument<'_>]) -> Job {
    let owned: Vec<OwnedArgument> = args.iter().map(|a| a.to_owned_arg()).collect();
    Box::new(move |backend: &dyn Backend| {
        let args: Vec<Argument<'_>> = owned.iter().map(|a| a.borrow()).collect();
        execute(backend, command, &args)
    })
}

fn split_global<'a, 'b>(args: &'b [Argument<'a>]) -> DbxResult<(String, &'b [Argument<'a>])> {
    match args.split_first() {
        Some((global, rest)) if !global.is_empty() => Ok((global.as_str().into_owned(), rest)),
        _ => Err(DbxError::backend(isc::BAD_GLOBAL, "Invalid global name")),
    }
}

fn arg_text(args: &[Argument<'_>], n: usize) -> String {
    args.get(n).map(|a| a.as_str().into_owned()).unwrap_or_default()
}

fn oref(args: &[Argument<'_>]) -> DbxResult<i64> {
    args.first()
        .map(|a| a.to_int())
        .ok_or_else(|| DbxError::backend(isc::ERBADOREF, "Invalid object reference"))
}

fn object_reply(value: ObjectValue) -> Reply {
    match value {
        ObjectValue::Data(bytes) => Reply::Value(bytes),
        ObjectValue::Oref(oref) => Reply::Oref(oref),
    }
}

/// Run one operation directly on `backend`.
pub fn execute(backend: &dyn Backend, command: Command, args: &[Argument<'_>]) -> DbxResult<Reply> {
    match command {
        Command::Set => {
            let (global, rest) = split_global(args)?;
            let (value, subs) = rest
                .split_last()
                .ok_or_else(|| DbxError::BadArgument("No value to set".to_string()))?;
            backend.set(&global, subs, value)?;
            Ok(Reply::ok())
        }
        Command::Get => {
            let (global, subs) = split_global(args)?;
            Ok(Reply::Value(backend.get(&global, subs)?.unwrap_or_default()))
        }
        Command::Next | Command::Previous => {
            let (global, subs) = split_global(args)?;
            let dir = if command == Command::Next {
                Direction::Forward
            } else {
                Direction::Backward
            };
            Ok(Reply::Value(backend.order(&global, subs, dir)?))
        }
        Command::NextNode | Command::PreviousNode => {
            let (global, subs) = split_global(args)?;
            let dir = if command == Command::NextNode {
                Direction::Forward
            } else {
                Direction::Backward
            };
            Ok(Reply::Keys(backend.query(&global, subs, dir)?.unwrap_or_default()))
        }
        Command::Delete => {
            let (global, subs) = split_global(args)?;
            backend.delete(&global, subs)?;
            Ok(Reply::ok())
        }
        Command::Defined => {
            let (global, subs) = split_global(args)?;
            Ok(Reply::text(backend.defined(&global, subs)?.to_string()))
        }
        Command::Increment => {
            let (global, rest) = split_global(args)?;
            let (by, subs) = match rest.split_last() {
                Some((by, subs)) if by.len() >= MAX_INCREMENT_LEN => (1.0, subs),
                Some((by, subs)) => (by.to_double(), subs),
                None => (1.0, rest),
            };
            Ok(Reply::Value(backend.increment(&global, subs, by)?))
        }
        Command::Lock => {
            let (global, rest) = split_global(args)?;
            let (timeout, subs) = match rest.split_last() {
                Some((timeout, subs)) => (timeout.to_int(), subs),
                None => (-1, rest),
            };
            let acquired = backend.lock(&global, subs, timeout)?;
            Ok(Reply::text(if acquired { "1" } else { "0" }))
        }
        Command::Unlock => {
            let (global, subs) = split_global(args)?;
            backend.unlock(&global, subs)?;
            Ok(Reply::text("1"))
        }
        Command::Function => {
            let name = arg_text(args, 0);
            let (label, routine) = split_function_name(&name)
                .ok_or_else(|| DbxError::backend(isc::BAD_FUNCTION, "Invalid function name"))?;
            let rest = args.get(1..).unwrap_or_default();
            Ok(Reply::Value(backend.function(label, routine, rest)?))
        }
        Command::ClassMethod => {
            let class = arg_text(args, 0);
            let method = arg_text(args, 1);
            let rest = args.get(2..).unwrap_or_default();
            Ok(object_reply(backend.class_method(&class, &method, rest)?))
        }
        Command::Method => {
            let oref = oref(args)?;
            let method = arg_text(args, 1);
            let rest = args.get(2..).unwrap_or_default();
            Ok(object_reply(backend.method(oref, &method, rest)?))
        }
        Command::GetProperty => {
            let oref = oref(args)?;
            Ok(object_reply(backend.get_property(oref, &arg_text(args, 1))?))
        }
        Command::SetProperty => {
            let oref = oref(args)?;
            let empty = Argument::new(b"");
            let value = args.get(2).unwrap_or(&empty);
            backend.set_property(oref, &arg_text(args, 1), value)?;
            Ok(Reply::ok())
        }
        Command::CloseInstance => {
            backend.close_instance(oref(args)?)?;
            Ok(Reply::ok())
        }
        Command::GetNamespace => Ok(Reply::Value(backend.get_namespace()?)),
        Command::SetNamespace => {
            let namespace = arg_text(args, 0);
            if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN {
                return Err(DbxError::backend(isc::ERNAMSP, "Invalid Namespace"));
            }
            backend.set_namespace(&namespace)?;
            Ok(Reply::text(namespace))
        }
        Command::TStart => {
            backend.tstart()?;
            Ok(Reply::ok())
        }
        Command::TLevel => Ok(Reply::text(backend.tlevel()?.to_string())),
        Command::TCommit => {
            backend.tcommit()?;
            Ok(Reply::ok())
        }
        Command::TRollback => {
            backend.trollback()?;
            Ok(Reply::ok())
        }
        Command::Open | Command::Close => Err(DbxError::BadArgument(format!(
            "{} is not an operation on an open connection",
            command
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryBackend;

    fn a(s: &str) -> Argument<'_> {
        Argument::new(s.as_bytes())
    }

    fn value(reply: Reply) -> String {
        match reply {
            Reply::Value(bytes) => String::from_utf8(bytes).unwrap(),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_global_operations() {
        let db = MemoryBackend::new(DbType::Iris);
        execute(&db, Command::Set, &[a("^g"), a("1"), a("hello")]).unwrap();
        assert_eq!(value(execute(&db, Command::Get, &[a("^g"), a("1")]).unwrap()), "hello");
        assert_eq!(value(execute(&db, Command::Get, &[a("^g"), a("2")]).unwrap()), "");
        assert_eq!(value(execute(&db, Command::Defined, &[a("^g")]).unwrap()), "10");
        assert_eq!(value(execute(&db, Command::Next, &[a("^g"), a("")]).unwrap()), "1");
        assert_eq!(value(execute(&db, Command::Next, &[a("^g"), a("1")]).unwrap()), "");
    }

    #[test]
    fn test_long_increment_counts_as_one() {
        let db = MemoryBackend::new(DbType::YottaDb);
        let long = "7".repeat(MAX_INCREMENT_LEN);
        assert_eq!(value(execute(&db, Command::Increment, &[a("^n"), a(&long)]).unwrap()), "1");
        assert_eq!(value(execute(&db, Command::Increment, &[a("^n"), a("2.5")]).unwrap()), "3.5");
    }

    #[test]
    fn test_invalid_names() {
        let db = MemoryBackend::new(DbType::Cache);
        let err = execute(&db, Command::Get, &[a("")]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid global name");

        let err = execute(&db, Command::Function, &[a("nocaret")]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid function name");
        assert_eq!(err.error_code(), 1004);

        let err = execute(&db, Command::SetNamespace, &[a("")]).unwrap_err();
        assert_eq!(err.error_code(), isc::ERNAMSP);
        let long = "N".repeat(MAX_NAMESPACE_LEN + 1);
        assert!(execute(&db, Command::SetNamespace, &[a(&long)]).is_err());
    }

    #[test]
    fn test_lock_and_unlock() {
        let db = MemoryBackend::new(DbType::YottaDb);
        assert_eq!(value(execute(&db, Command::Lock, &[a("^l"), a("1"), a("5")]).unwrap()), "1");
        assert_eq!(value(execute(&db, Command::Unlock, &[a("^l"), a("1")]).unwrap()), "1");
    }

    #[test]
    fn test_open_is_not_an_operation() {
        let db = MemoryBackend::new(DbType::YottaDb);
        assert!(matches!(
            execute(&db, Command::Open, &[]),
            Err(DbxError::BadArgument(_))
        ));
    }
}
