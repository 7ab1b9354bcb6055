use crate::conn::ConnCore;

/// Populate the CGI-style variable surface for handlers that want it.
///
/// Variables land in the request's form-variable map alongside query and
/// body variables.
pub(crate) fn create_cgi_vars(core: &mut ConnCore) {
    let server_name = core
        .host
        .as_ref()
        .map(|h| h.name().to_string())
        .unwrap_or_default();
    let protocol = match core.protocol {
        http::Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let local_port = core.local_addr.map(|a| a.port()).unwrap_or(0);
    let (remote_addr, remote_port) = match core.peer_addr {
        Some(addr) => (addr.ip().to_string(), addr.port()),
        None => (String::new(), 0),
    };
    let script_name = core
        .rx_ref()
        .route
        .as_ref()
        .map(|r| r.name().to_string())
        .unwrap_or_default();

    let method = core.rx_ref().method.as_str().to_string();
    let query = core
        .rx_ref()
        .parsed_uri
        .as_ref()
        .and_then(|uri| uri.query())
        .unwrap_or("")
        .to_string();
    let path = core
        .rx_ref()
        .parsed_uri
        .as_ref()
        .map(|uri| uri.path().to_string())
        .unwrap_or_default();

    let rx = core.rx_mut();
    let uri = rx.original_uri.clone();
    let content_type = rx.mime_type.clone().unwrap_or_default();
    let content_length = rx
        .content_length
        .map(|n| n.to_string())
        .unwrap_or_default();
    let auth_type = rx.auth_type.clone().unwrap_or_default();
    let auth_user = rx.auth_user.clone().unwrap_or_default();

    let vars = &mut rx.form_vars;
    vars.set("REQUEST_METHOD", method);
    vars.set("REQUEST_URI", uri);
    vars.set("QUERY_STRING", query);
    vars.set("CONTENT_TYPE", content_type);
    vars.set("CONTENT_LENGTH", content_length);
    vars.set("SCRIPT_NAME", script_name);
    vars.set("PATH_INFO", path.clone());
    vars.set("PATH_TRANSLATED", path);
    vars.set("SERVER_NAME", server_name);
    vars.set("SERVER_PORT", local_port.to_string());
    vars.set("SERVER_PROTOCOL", protocol);
    vars.set("REMOTE_ADDR", remote_addr);
    vars.set("REMOTE_PORT", remote_port.to_string());
    vars.set("REMOTE_USER", auth_user);
    vars.set("AUTH_TYPE", auth_type);
}

/// Define the per-upload variable surface for the file at `index`.
pub(crate) fn define_file_fields(core: &mut ConnCore, index: usize) {
    let (name, client, content_type, temp, size) = {
        let file = &core.rx_ref().files[index];
        (
            file.name.clone(),
            file.client_filename.clone(),
            file.content_type.clone().unwrap_or_default(),
            file.temp_filename.display().to_string(),
            file.size,
        )
    };
    let vars = &mut core.rx_mut().form_vars;
    vars.set(format!("FILE_{}_NAME", index), name);
    vars.set(format!("FILE_{}_CLIENT_FILENAME", index), client);
    vars.set(format!("FILE_{}_CONTENT_TYPE", index), content_type);
    vars.set(format!("FILE_{}_FILENAME", index), temp);
    vars.set(format!("FILE_{}_SIZE", index), size.to_string());
}
