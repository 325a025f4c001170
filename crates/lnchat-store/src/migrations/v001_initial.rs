//! v001 -- Initial schema creation.
//!
//! One table per entity. Nested LN records (HTLCs, routes) are kept as JSON
//! columns; every lookup key lives in its own column with a unique index.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Contacts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name TEXT NOT NULL,
    alias        TEXT NOT NULL,
    address      TEXT NOT NULL                 -- 66 hex chars
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_address ON contacts(address);

-- ----------------------------------------------------------------
-- Discussions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS discussions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    participants     TEXT NOT NULL,            -- JSON array, original order
    participants_key TEXT NOT NULL,            -- sorted, comma-joined
    last_read_id     INTEGER NOT NULL DEFAULT 0,
    last_message_id  INTEGER NOT NULL DEFAULT 0,
    fee_limit_msat   INTEGER NOT NULL,
    anonymous        INTEGER NOT NULL DEFAULT 0,

    CHECK (last_read_id <= last_message_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_discussions_participants
    ON discussions(participants_key);

-- ----------------------------------------------------------------
-- Raw messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS raw_messages (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    discussion_id        INTEGER,              -- NULL until resolved
    raw_payload          BLOB NOT NULL,
    sender               TEXT,
    signature            BLOB NOT NULL,
    signature_verified   INTEGER NOT NULL DEFAULT 0,
    invoice_settle_index INTEGER NOT NULL DEFAULT 0,
    payment_indexes      TEXT NOT NULL DEFAULT '[]',  -- JSON array
    timestamp            TEXT NOT NULL,        -- RFC-3339

    CHECK ((invoice_settle_index > 0) <> (payment_indexes <> '[]')),
    FOREIGN KEY (discussion_id) REFERENCES discussions(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_raw_messages_settle_index
    ON raw_messages(invoice_settle_index) WHERE invoice_settle_index > 0;

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    discussion_id    INTEGER NOT NULL,
    raw_message_id   INTEGER NOT NULL,
    payload          TEXT NOT NULL,
    amt_msat         INTEGER NOT NULL,
    sender           TEXT,
    receiver         TEXT,
    sender_verified  INTEGER NOT NULL DEFAULT 0,
    sent_time_ns     INTEGER NOT NULL,
    received_time_ns INTEGER NOT NULL,
    idx              INTEGER NOT NULL DEFAULT 0,
    total_fees_msat  INTEGER NOT NULL DEFAULT 0,
    routes           TEXT NOT NULL DEFAULT '[]',  -- JSON array
    preimage_hash    BLOB NOT NULL,
    preimage         BLOB NOT NULL,
    pay_req          TEXT NOT NULL DEFAULT '',
    success_prob     REAL NOT NULL,

    FOREIGN KEY (discussion_id) REFERENCES discussions(id) ON DELETE CASCADE,
    FOREIGN KEY (raw_message_id) REFERENCES raw_messages(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_raw_message ON messages(raw_message_id);
CREATE INDEX IF NOT EXISTS idx_messages_discussion ON messages(discussion_id, id);

-- ----------------------------------------------------------------
-- Invoices
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS invoices (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    add_index       INTEGER NOT NULL,
    settle_index    INTEGER NOT NULL DEFAULT 0,
    preimage        TEXT,                      -- hex, NULL while unknown
    r_hash          TEXT NOT NULL,
    state           TEXT NOT NULL,
    creator_address TEXT NOT NULL,
    record          TEXT NOT NULL              -- JSON LnInvoice
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_invoices_add_index ON invoices(add_index);
CREATE UNIQUE INDEX IF NOT EXISTS idx_invoices_settle_index
    ON invoices(settle_index) WHERE settle_index > 0;
CREATE UNIQUE INDEX IF NOT EXISTS idx_invoices_preimage
    ON invoices(preimage) WHERE preimage IS NOT NULL;

-- ----------------------------------------------------------------
-- Payments
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS payments (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    payment_index INTEGER NOT NULL,
    payment_hash  TEXT NOT NULL,
    status        TEXT NOT NULL,
    payer_address TEXT NOT NULL,
    payee_address TEXT,
    record        TEXT NOT NULL                -- JSON LnPayment
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_payment_index ON payments(payment_index);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
