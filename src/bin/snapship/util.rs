use snapship::btrfs::BtrfsCli;
use snapship::cancel::CancelToken;
use snapship::remote::SshRemote;
use snapship::BackupConfig;

/// Real host collaborators for `cfg` and the signal-aware token of this run.
pub fn hosts(cfg: &BackupConfig) -> (BtrfsCli, SshRemote, CancelToken) {
    let cancel = CancelToken::with_signals();
    let local = BtrfsCli::new(cfg.command_timeout);
    let remote = SshRemote::new(cfg.remote_host.clone())
        .with_port(cfg.remote_port)
        .with_identity(cfg.ssh_identity.clone())
        .with_sudo(cfg.remote_sudo)
        .with_timeouts(cfg.connect_timeout, cfg.command_timeout);
    (local, remote, cancel)
}
