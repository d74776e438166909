//! Persisted per-table synchronization state.
//!
//! A table moves through the phases below. The actor named in brackets owns the phase: it is
//! the only one allowed to write the table row while the table sits there, and the only one
//! that moves it on.
//!
//! ```text
//!   Missing      [main]   --drop fkeys, launch copy-->            InCopy
//!   InCopy       [copy]   --bulk copy done, snapshot saved-->     CatchingUp
//!   CatchingUp   [copy]   --replication lag drained-->            WannaSync(tick)
//!   WannaSync    [main]   --main reached tick-->                  DoSync(main tick)
//!   DoSync       [copy]   --copy reached exact tick-->            Ok
//!   any          [admin]  --resync-->                             Missing
//! ```

pub mod table;
