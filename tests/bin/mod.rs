mod render_approvals_test;
