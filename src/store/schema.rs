pub const SCHEMA: &str = r#"
-- Package repositories
CREATE TABLE IF NOT EXISTS repositories (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    url TEXT NOT NULL,
    credential_ref TEXT,          -- opaque handle resolved by the fetcher

    scope TEXT NOT NULL,          -- 'global' or 'workspace'
    workspace TEXT,               -- set iff scope = 'workspace'

    sync_period_secs INTEGER,     -- NULL = manual indexing only
    status TEXT NOT NULL DEFAULT 'active',
    last_indexed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    stamp INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS categories (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    stamp INTEGER NOT NULL DEFAULT 1
);

-- App templates come from a repository (indexed) or a workspace (uploaded)
CREATE TABLE IF NOT EXISTS app_templates (
    id TEXT PRIMARY KEY,
    repository_id TEXT REFERENCES repositories(id),
    workspace TEXT,
    name TEXT NOT NULL,
    description TEXT,
    owner TEXT NOT NULL,
    category_id TEXT REFERENCES categories(id),
    status TEXT NOT NULL DEFAULT 'active',
    suspended_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    stamp INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS app_versions (
    id TEXT PRIMARY KEY,
    app_template_id TEXT NOT NULL REFERENCES app_templates(id),
    version TEXT NOT NULL,
    description TEXT,
    package_ref TEXT NOT NULL,    -- 'attachment:<id>' or upstream URL
    owner TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    stamp INTEGER NOT NULL DEFAULT 1
);

-- Append-only workflow trail
CREATE TABLE IF NOT EXISTS audit_records (
    version_id TEXT NOT NULL REFERENCES app_versions(id),
    seq INTEGER NOT NULL,
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    action TEXT NOT NULL,
    actor TEXT NOT NULL,
    message TEXT,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (version_id, seq)
);

-- Append-only indexing trail
CREATE TABLE IF NOT EXISTS repo_events (
    repository_id TEXT NOT NULL REFERENCES repositories(id),
    seq INTEGER NOT NULL,
    job_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    detail TEXT,
    PRIMARY KEY (repository_id, seq)
);

-- Single-flight key for indexing, one row per repository with a live job
CREATE TABLE IF NOT EXISTS index_leases (
    repository_id TEXT PRIMARY KEY REFERENCES repositories(id),
    job_id TEXT NOT NULL,
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

-- Deployed instances
CREATE TABLE IF NOT EXISTS applications (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    app_template_id TEXT NOT NULL REFERENCES app_templates(id),
    app_version_id TEXT NOT NULL REFERENCES app_versions(id),
    pending_version_id TEXT REFERENCES app_versions(id),
    workspace TEXT NOT NULL,
    cluster TEXT NOT NULL,
    namespace TEXT NOT NULL,
    status TEXT NOT NULL,
    conclusion_ref TEXT,
    conf TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    stamp INTEGER NOT NULL DEFAULT 1
);

-- Version binding history, one row per install or confirmed upgrade
CREATE TABLE IF NOT EXISTS application_bindings (
    application_id TEXT NOT NULL REFERENCES applications(id),
    seq INTEGER NOT NULL,
    app_version_id TEXT NOT NULL REFERENCES app_versions(id),
    bound_at TEXT NOT NULL,
    PRIMARY KEY (application_id, seq)
);

CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    content_type TEXT,
    size INTEGER NOT NULL,
    digest TEXT NOT NULL,         -- sha256 hex of the blob
    created_at TEXT NOT NULL
);

-- Names are unique among live rows only
CREATE UNIQUE INDEX IF NOT EXISTS idx_repositories_name
    ON repositories(scope, IFNULL(workspace, ''), name) WHERE status != 'deleted';
CREATE UNIQUE INDEX IF NOT EXISTS idx_templates_name
    ON app_templates(IFNULL(repository_id, ''), IFNULL(workspace, ''), name) WHERE status != 'deleted';
CREATE UNIQUE INDEX IF NOT EXISTS idx_versions_version
    ON app_versions(app_template_id, version) WHERE status != 'deleted';
CREATE UNIQUE INDEX IF NOT EXISTS idx_applications_name
    ON applications(workspace, cluster, namespace, name) WHERE status != 'deleted';

CREATE INDEX IF NOT EXISTS idx_templates_repository ON app_templates(repository_id);
CREATE INDEX IF NOT EXISTS idx_templates_category ON app_templates(category_id);
CREATE INDEX IF NOT EXISTS idx_versions_template ON app_versions(app_template_id);
CREATE INDEX IF NOT EXISTS idx_applications_version ON applications(app_version_id);
CREATE INDEX IF NOT EXISTS idx_applications_pending ON applications(pending_version_id);
CREATE INDEX IF NOT EXISTS idx_applications_scope ON applications(workspace, cluster, namespace);
CREATE INDEX IF NOT EXISTS idx_attachments_digest ON attachments(digest);
"#;
