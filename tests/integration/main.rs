mod common;

mod lib_cleanup_mode;
mod lib_close_with_signal;
mod lib_fail_when_no_forward_starts;
mod lib_keep_running_without_proxy;
mod manager_stop_proxy_with_last_route;
mod proxy_route_by_host;
mod session_survive_tunnel_failure;
