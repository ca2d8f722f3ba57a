mod test_via_received;
